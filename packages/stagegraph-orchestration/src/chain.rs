use crate::backend::StageSubmission;
use crate::job::JobHandle;

/// Threads the handle of the last submitted stage into the next one.
///
/// On a cluster the handle becomes a wait directive in the next script
/// header. Local submissions return [`JobHandle::Empty`], so the chain
/// stays empty and stages simply run one after another.
#[derive(Debug, Clone, Default)]
pub struct DependencyChain {
    last: JobHandle,
}

impl DependencyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from work submitted outside this chain
    pub fn with_predecessor(handle: JobHandle) -> Self {
        Self { last: handle }
    }

    pub fn predecessor(&self) -> &JobHandle {
        &self.last
    }

    pub fn bind(&self, submission: &mut StageSubmission) {
        submission.predecessor = self.last.clone();
    }

    /// Record the handle a submission produced. Process handles are not
    /// wait preconditions and leave the chain empty.
    pub fn advance(&mut self, handle: JobHandle) {
        self.last = match handle {
            JobHandle::Scheduler(id) if !id.is_empty() => JobHandle::Scheduler(id),
            _ => JobHandle::Empty,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeSpec;
    use crate::task::CompletionCriterion;

    fn submission() -> StageSubmission {
        StageSubmission {
            stage: "acc.1".to_string(),
            tasks: Vec::new(),
            total_tasks: 4,
            range: RangeSpec::Span { start: 1, end: 4 },
            predecessor: JobHandle::Scheduler("stale".to_string()),
            criterion: CompletionCriterion::default(),
        }
    }

    #[test]
    fn test_empty_chain_binds_no_predecessor() {
        let chain = DependencyChain::new();
        let mut next = submission();
        chain.bind(&mut next);
        assert_eq!(next.predecessor, JobHandle::Empty);
    }

    #[test]
    fn test_advance_threads_scheduler_handle() {
        let mut chain = DependencyChain::new();
        chain.advance(JobHandle::Scheduler("1234[]".to_string()));

        let mut next = submission();
        chain.bind(&mut next);
        assert_eq!(next.predecessor.scheduler_id(), Some("1234[]"));

        chain.advance(JobHandle::Scheduler("1235".to_string()));
        assert_eq!(chain.predecessor().scheduler_id(), Some("1235"));
    }

    #[test]
    fn test_local_handles_do_not_chain() {
        let mut chain = DependencyChain::with_predecessor(JobHandle::Scheduler("9".to_string()));
        chain.advance(JobHandle::Processes(vec![100, 101]));
        assert_eq!(chain.predecessor(), &JobHandle::Empty);

        chain.advance(JobHandle::Empty);
        assert!(chain.predecessor().is_empty());
    }
}
