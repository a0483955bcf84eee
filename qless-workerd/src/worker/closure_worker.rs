// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Worker kinds defined by a closure, for embedding programs that register
//! their own workers without writing a factory type.

use crate::queue::QueueClient;
use crate::worker::{Worker, WorkerFactory, WorkerSpec};

pub type WorkerBody = Box<dyn FnMut() -> anyhow::Result<()>>;

type BodyCreator =
    Box<dyn Fn(&WorkerSpec, Box<dyn QueueClient>) -> anyhow::Result<WorkerBody> + Send + Sync>;

pub struct ClosureWorker {
    desc: String,
    body: WorkerBody,
}

impl Worker for ClosureWorker {
    fn desc(&self) -> &str {
        &self.desc
    }

    fn run(&mut self) -> anyhow::Result<()> {
        (self.body)()
    }
}

pub struct ClosureFactory {
    desc: String,
    body_creator: BodyCreator,
}

impl ClosureFactory {
    pub fn new<F>(desc: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkerSpec, Box<dyn QueueClient>) -> anyhow::Result<WorkerBody>
            + Send // the registry is shared with the launcher
            + Sync
            + 'static,
    {
        Self {
            desc: desc.into(),
            body_creator: Box::new(f),
        }
    }
}

impl WorkerFactory for ClosureFactory {
    fn create(
        &self,
        spec: &WorkerSpec,
        client: Box<dyn QueueClient>,
    ) -> anyhow::Result<Box<dyn Worker>> {
        let creator = &self.body_creator;
        let body = creator(spec, client)?;
        Ok(Box::new(ClosureWorker {
            desc: format!("{} (slot {})", self.desc, spec.slot),
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::queue::{NewJob, SpoolClient};
    use crate::worker::{test_support, WorkerRegistry};

    #[test]
    fn registered_closure_drains_its_queue() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(dir.path(), &[]);
        let spool = SpoolClient::open(&spec.client.spool).unwrap();
        spool.put("q", NewJob::new("a", serde_json::json!({}))).unwrap();
        spool.put("q", NewJob::new("b", serde_json::json!({}))).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut registry = WorkerRegistry::with_builtins();
        registry.register(
            "counting",
            ClosureFactory::new("counting worker", move |spec, client| {
                let counter = counter.clone();
                let name = spec.worker_name();
                Ok(Box::new(move || -> anyhow::Result<()> {
                    while let Some(job) = client.pop("q", &name)? {
                        counter.fetch_add(1, Ordering::SeqCst);
                        client.complete(&job, &name)?;
                    }
                    Ok(())
                }) as WorkerBody)
            }),
        );

        let factory = registry.resolve("counting").unwrap();
        let mut worker = factory.create(&spec, Box::new(spool)).unwrap();
        assert_eq!(worker.desc(), "counting worker (slot 0)");
        worker.run().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn creator_errors_are_passed_on() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(dir.path(), &[]);
        let spool = SpoolClient::open(&spec.client.spool).unwrap();
        let factory = ClosureFactory::new("broken", |_, _| Err(anyhow::anyhow!("no body")));
        let err = factory.create(&spec, Box::new(spool)).unwrap_err();
        assert_eq!(err.to_string(), "no body");
    }
}
