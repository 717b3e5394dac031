//! Pre-submit hooks applied to a mapped object before it is created.

use capstan_core::CapstanResult;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

/// A mutation run on the plain, unsubmitted object.
pub trait DesireOption<K>: Send + Sync {
    fn apply(&self, obj: &mut K) -> CapstanResult<()>;
}

impl<K, F> DesireOption<K> for F
where
    F: Fn(&mut K) -> CapstanResult<()> + Send + Sync,
{
    fn apply(&self, obj: &mut K) -> CapstanResult<()> { self(obj) }
}

pub fn apply_options<K>(obj: &mut K, opts: &[&dyn DesireOption<K>]) -> CapstanResult<()> {
    opts.iter().try_for_each(|opt| opt.apply(obj))
}

/// Mark the object as owned by `owner`; garbage collection then removes it with its owner.
pub fn with_owner_reference<K: Resource>(owner: OwnerReference) -> impl DesireOption<K> {
    move |obj: &mut K| {
        obj.meta_mut().owner_references.get_or_insert_with(Vec::new).push(owner.clone());
        Ok(())
    }
}

pub fn with_label<K: Resource>(key: impl Into<String>, value: impl Into<String>) -> impl DesireOption<K> {
    let (key, value) = (key.into(), value.into());
    move |obj: &mut K| {
        obj.meta_mut().labels.get_or_insert_with(Default::default).insert(key.clone(), value.clone());
        Ok(())
    }
}
