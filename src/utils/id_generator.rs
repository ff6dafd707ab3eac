//! Identifier generation for workflows and jobs.

use uuid::Uuid;

/// Generates prefixed, collision-free identifiers.
///
/// Ids are uuid-v4 based: short enough to log, unique without coordination.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn workflow_id(&self) -> String {
        format!("wf-{}", Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn job_id(&self) -> String {
        format!("job-{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let ids = IdGenerator::new();
        let a = ids.job_id();
        let b = ids.job_id();
        assert!(a.starts_with("job-"));
        assert!(ids.workflow_id().starts_with("wf-"));
        assert_ne!(a, b);
    }
}
