//! Startup recovery of invocations interrupted by a previous process.

use tracing::{info, warn};

use crate::clock;
use crate::core::spec::ApiSpec;
use crate::core::types::{CollectionKey, Status};
use crate::invocation::{Outcome, apply_outcome};
use crate::io::store::{Instances, StoreError};

pub const INTERRUPTED_MESSAGE: &str = "invocation interrupted by server restart";

/// Mark every instance persisted as `running` in a declared collection as `error`.
///
/// Returns the number of instances marked. Must run before the server accepts
/// requests: the processes that belonged to these instances no longer exist.
pub fn recover_interrupted(spec: &ApiSpec, store: &Instances) -> Result<usize, StoreError> {
    let collections = spec
        .executables
        .keys()
        .map(CollectionKey::executable)
        .chain(spec.invokers.keys().map(CollectionKey::invoker));

    let mut recovered = 0;
    for collection in collections {
        for instance in store.list(&collection, Some(Status::Running))? {
            warn!(collection = %collection, id = %instance.id, "marking interrupted invocation as error");
            let failed = apply_outcome(instance, Outcome::failed(INTERRUPTED_MESSAGE), clock::now());
            store.save(&collection, failed)?;
            recovered += 1;
        }
    }
    if recovered > 0 {
        info!(recovered, "recovered interrupted invocations");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Instance;
    use crate::io::store::MemoryStore;
    use crate::test_support::sample_spec;
    use std::sync::Arc;

    /// Only running instances are touched; terminal and prepare ones stay as they were.
    #[test]
    fn marks_only_running_instances() {
        let store = Instances::new(Arc::new(MemoryStore::default()), 1024);
        let key = CollectionKey::executable("echo");
        for (id, status) in [
            ("a", Status::Running),
            ("b", Status::Prepare),
            ("c", Status::Finished),
        ] {
            store
                .save(&key, Instance::new(id, status))
                .expect("save");
        }

        let count = recover_interrupted(&sample_spec(), &store).expect("recover");
        assert_eq!(count, 1);

        let a = store.get(&key, "a").expect("get").expect("a");
        assert_eq!(a.status, Status::Error);
        assert!(a.failed.is_some());
        assert_eq!(
            a.error.as_ref().map(|detail| detail.message.as_str()),
            Some(INTERRUPTED_MESSAGE)
        );
        let b = store.get(&key, "b").expect("get").expect("b");
        assert_eq!(b.status, Status::Prepare);
    }
}
