//! Batch planner: decides which requests run each pass.
//!
//! Every pass follows the same protocol:
//! 1. Reset the pool budget
//! 2. Reserve budget for running requests (one decode token each), preempting
//!    any that no longer fit
//! 3. Admit waiting requests in arrival order while reservations succeed
//! 4. After execution, commit real blocks with `prepare_cache` and release
//!    finished requests
//!
//! Requests that are not running hold only the shared null block.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::block_pool::PoolError;
use crate::cache::global_pool::SharedPool;
use crate::cache::serving::ServingCacheTable;
use crate::config::SchedulerConfig;

/// Unique request identifier.
pub type RequestId = Uuid;

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued or preempted; holds the null block.
    Waiting,
    /// Part of the current batch set; holds real blocks.
    Running,
    /// Done; cache released.
    Finished,
}

/// One generation request and its cache.
#[derive(Debug)]
pub struct Request {
    /// Unique request ID.
    pub id: RequestId,

    /// Prompt length in tokens.
    pub prompt_tokens: usize,

    /// Tokens to generate.
    pub max_tokens: usize,

    /// Tokens generated so far.
    pub generated: usize,

    /// Current lifecycle state.
    pub state: RequestState,

    cache: ServingCacheTable,
}

impl Request {
    /// Tokens a prefill (or recompute after preemption) writes to the cache.
    fn prefill_tokens(&self) -> usize {
        self.prompt_tokens + self.generated
    }

    fn is_done(&self) -> bool {
        self.generated >= self.max_tokens
    }

    pub fn cache(&self) -> &ServingCacheTable {
        &self.cache
    }
}

/// A request picked for this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRequest {
    pub id: RequestId,
    /// Tokens written to the cache by this step.
    pub num_tokens: usize,
    pub is_prefill: bool,
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOutput {
    /// Budget pass this batch was planned in.
    pub pass: u64,
    /// Requests to execute, in batch order.
    pub scheduled: Vec<ScheduledRequest>,
    /// Running requests moved back to the waiting queue.
    pub preempted: Vec<RequestId>,
    /// Total new tokens in the batch.
    pub num_batched_tokens: usize,
}

impl SchedulerOutput {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

/// Result of committing an executed batch.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Requests that generated their last token.
    pub finished: Vec<RequestId>,
    /// Requests dropped because their blocks could not be committed.
    pub aborted: Vec<RequestId>,
}

/// First-come-first-served batch planner.
pub struct Scheduler {
    /// Shared block pool.
    pool: SharedPool,

    /// Batch limits.
    config: SchedulerConfig,

    /// Requests waiting for admission, oldest first.
    waiting: VecDeque<Request>,

    /// Requests holding real blocks.
    running: Vec<Request>,
}

impl Scheduler {
    pub fn new(pool: SharedPool, config: SchedulerConfig) -> Self {
        Self {
            pool,
            config,
            waiting: VecDeque::new(),
            running: Vec::new(),
        }
    }

    /// Queue a request. Requests that could never fit in the pool are
    /// rejected up front.
    pub fn add_request(
        &mut self,
        prompt_tokens: usize,
        max_tokens: usize,
    ) -> Result<RequestId, PoolError> {
        let mut cache = ServingCacheTable::new(self.pool.clone());

        let required = cache.required_blocks(prompt_tokens + max_tokens);
        let usable = self.pool.lock().pool().usable_blocks();
        if required > usable {
            return Err(PoolError::OutOfBlocks {
                requested: required,
                available: usable,
            });
        }

        cache.assign_null_block()?;
        let request = Request {
            id: Uuid::new_v4(),
            prompt_tokens,
            max_tokens,
            generated: 0,
            state: RequestState::Waiting,
            cache,
        };
        let id = request.id;

        debug!(request_id = %id, prompt_tokens, max_tokens, "Request queued");
        self.waiting.push_back(request);
        Ok(id)
    }

    /// Plan the next batch.
    pub fn schedule(&mut self) -> Result<SchedulerOutput, PoolError> {
        let pass = {
            let mut pool = self.pool.lock();
            pool.reset_budget();
            pool.log_status();
            pool.pass()
        };

        let mut output = SchedulerOutput {
            pass,
            ..Default::default()
        };
        let mut preempted: Vec<(usize, Request)> = Vec::new();

        // Oldest first; under pressure the newest running request gives way.
        let mut queue: VecDeque<(usize, Request)> =
            std::mem::take(&mut self.running).into_iter().enumerate().collect();

        while let Some((position, mut request)) = queue.pop_front() {
            loop {
                if !self.fits_batch(&output, 1) {
                    self.preempt(&mut request, &mut output)?;
                    preempted.push((position, request));
                    break;
                }
                if request.cache.try_reserve_budget(1) {
                    output.scheduled.push(ScheduledRequest {
                        id: request.id,
                        num_tokens: 1,
                        is_prefill: false,
                    });
                    output.num_batched_tokens += 1;
                    self.running.push(request);
                    break;
                }
                match queue.pop_back() {
                    Some((victim_position, mut victim)) => {
                        self.preempt(&mut victim, &mut output)?;
                        preempted.push((victim_position, victim));
                    }
                    None => {
                        self.preempt(&mut request, &mut output)?;
                        preempted.push((position, request));
                        break;
                    }
                }
            }
        }

        // Preempted requests go back ahead of everything that never ran,
        // keeping their original order.
        preempted.sort_by_key(|(position, _)| *position);
        for (_, request) in preempted.into_iter().rev() {
            self.waiting.push_front(request);
        }

        // Waiting requests hold only the placeholder, so the whole prefill is
        // reserved as fresh blocks.
        while let Some(mut request) = self.waiting.pop_front() {
            let num_tokens = request.prefill_tokens();
            if self.fits_batch(&output, num_tokens) && request.cache.try_reserve_budget(num_tokens)
            {
                request.state = RequestState::Running;
                output.scheduled.push(ScheduledRequest {
                    id: request.id,
                    num_tokens,
                    is_prefill: true,
                });
                output.num_batched_tokens += num_tokens;
                self.running.push(request);
                continue;
            }

            self.waiting.push_front(request);
            break;
        }

        debug!(
            pass,
            scheduled = output.scheduled.len(),
            preempted = output.preempted.len(),
            waiting = self.waiting.len(),
            batched_tokens = output.num_batched_tokens,
            "Batch planned"
        );
        Ok(output)
    }

    /// Commit cache growth for an executed batch and retire finished requests.
    pub fn complete(&mut self, output: &SchedulerOutput) -> Result<StepOutput, PoolError> {
        let tokens: HashMap<RequestId, usize> = output
            .scheduled
            .iter()
            .map(|s| (s.id, s.num_tokens))
            .collect();

        let mut step = StepOutput::default();
        let mut still_running = Vec::with_capacity(self.running.len());

        for mut request in std::mem::take(&mut self.running) {
            let Some(&num_tokens) = tokens.get(&request.id) else {
                still_running.push(request);
                continue;
            };

            if let Err(e) = request.cache.prepare_cache(num_tokens) {
                error!(request_id = %request.id, error = %e, "Failed to commit cache");
                request.cache.release_cache()?;
                request.state = RequestState::Finished;
                step.aborted.push(request.id);
                continue;
            }

            request.generated += 1;
            if request.is_done() {
                request.cache.release_cache()?;
                request.state = RequestState::Finished;
                debug!(request_id = %request.id, generated = request.generated, "Request finished");
                step.finished.push(request.id);
                continue;
            }

            still_running.push(request);
        }

        self.running = still_running;
        Ok(step)
    }

    /// Plan and commit one pass.
    pub fn step(&mut self) -> Result<(SchedulerOutput, StepOutput), PoolError> {
        let output = self.schedule()?;
        let step = self.complete(&output)?;
        Ok((output, step))
    }

    /// Return a running request's blocks and budget and park it on the
    /// null block.
    fn preempt(
        &self,
        request: &mut Request,
        output: &mut SchedulerOutput,
    ) -> Result<(), PoolError> {
        request.cache.assign_null_block()?;
        request.state = RequestState::Waiting;
        info!(request_id = %request.id, pass = output.pass, "Preempted request");
        output.preempted.push(request.id);
        Ok(())
    }

    fn fits_batch(&self, output: &SchedulerOutput, num_tokens: usize) -> bool {
        output.scheduled.len() < self.config.max_num_seqs
            && output.num_batched_tokens + num_tokens <= self.config.max_batched_tokens
    }

    pub fn has_unfinished(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Look up a waiting or running request.
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.running
            .iter()
            .chain(self.waiting.iter())
            .find(|r| r.id == id)
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::global_pool::new_shared_pool;

    fn scheduler(num_blocks: usize, block_size: usize) -> Scheduler {
        let pool = new_shared_pool(num_blocks, block_size).unwrap();
        Scheduler::new(pool, SchedulerConfig::default())
    }

    #[test]
    fn test_waiting_request_holds_null_block() {
        let mut sched = scheduler(9, 4);
        let id = sched.add_request(6, 3).unwrap();

        let request = sched.request(id).unwrap();
        assert_eq!(request.state, RequestState::Waiting);
        assert_eq!(request.cache().block_table(), &[0]);
        assert_eq!(sched.pool().lock().pool().num_free(), 8);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut sched = scheduler(9, 4);
        let err = sched.add_request(30, 10).unwrap_err();
        assert_eq!(
            err,
            PoolError::OutOfBlocks {
                requested: 10,
                available: 8
            }
        );
        assert!(!sched.has_unfinished());
    }

    #[test]
    fn test_request_runs_to_completion() {
        let mut sched = scheduler(9, 4);
        let id = sched.add_request(6, 3).unwrap();

        let (output, step) = sched.step().unwrap();
        assert_eq!(
            output.scheduled,
            vec![ScheduledRequest {
                id,
                num_tokens: 6,
                is_prefill: true
            }]
        );
        assert!(step.finished.is_empty());
        assert_eq!(sched.request(id).unwrap().cache().block_table(), &[1, 2]);

        let (output, _) = sched.step().unwrap();
        assert!(!output.scheduled[0].is_prefill);

        let (_, step) = sched.step().unwrap();
        assert_eq!(step.finished, vec![id]);
        assert!(!sched.has_unfinished());

        let pool = sched.pool().lock();
        assert_eq!(pool.pool().num_free(), 8);
        assert_eq!(pool.pool().num_allocated(), 0);
    }

    #[test]
    fn test_budget_defers_second_request() {
        let mut sched = scheduler(9, 4);
        let a = sched.add_request(24, 2).unwrap();
        let b = sched.add_request(12, 2).unwrap();

        // A reserves 6 of 8 blocks; B needs 3.
        let output = sched.schedule().unwrap();
        assert_eq!(output.scheduled.len(), 1);
        assert_eq!(output.scheduled[0].id, a);
        assert_eq!(sched.num_waiting(), 1);
        assert_eq!(sched.request(b).unwrap().state, RequestState::Waiting);
        assert_eq!(sched.request(b).unwrap().cache().block_table(), &[0]);

        // Planning alone never touches the physical pool.
        assert_eq!(sched.pool().lock().pool().num_free(), 8);
    }

    #[test]
    fn test_batch_token_limit() {
        let pool = new_shared_pool(65, 4).unwrap();
        let config = SchedulerConfig {
            max_num_seqs: 8,
            max_batched_tokens: 10,
        };
        let mut sched = Scheduler::new(pool, config);
        sched.add_request(6, 2).unwrap();
        sched.add_request(6, 2).unwrap();

        let output = sched.schedule().unwrap();
        assert_eq!(output.scheduled.len(), 1);
        assert_eq!(output.num_batched_tokens, 6);
    }

    #[test]
    fn test_preemption_frees_blocks() {
        // 4 usable blocks of 4 tokens.
        let mut sched = scheduler(5, 4);
        let a = sched.add_request(8, 8).unwrap();
        let b = sched.add_request(8, 8).unwrap();

        // Both prefill into 2 blocks each; the pool is now full.
        let (output, _) = sched.step().unwrap();
        assert_eq!(output.scheduled.len(), 2);
        assert_eq!(sched.pool().lock().pool().num_free(), 0);

        // Each needs a fresh block for its next token. The newer request
        // gives its blocks up so the older one keeps running.
        let (output, _) = sched.step().unwrap();
        assert_eq!(output.preempted, vec![b]);
        assert_eq!(output.scheduled.len(), 1);
        assert_eq!(output.scheduled[0].id, a);
        assert_eq!(sched.request(a).unwrap().cache().block_table(), &[1, 2, 3]);

        let preempted = sched.request(b).unwrap();
        assert_eq!(preempted.state, RequestState::Waiting);
        assert_eq!(preempted.cache().block_table(), &[0]);
        assert_eq!(sched.pool().lock().pool().num_free(), 1);
    }

    #[test]
    fn test_preempted_requests_keep_arrival_order() {
        // 5 usable blocks of 4 tokens; prefills fill them exactly.
        let mut sched = scheduler(6, 4);
        let a = sched.add_request(8, 8).unwrap();
        let b = sched.add_request(8, 8).unwrap();
        let c = sched.add_request(4, 8).unwrap();

        let (output, _) = sched.step().unwrap();
        assert_eq!(output.scheduled.len(), 3);
        assert_eq!(sched.pool().lock().pool().num_free(), 0);

        // C's single block goes to A, then B has nothing left to evict but
        // itself.
        let (output, _) = sched.step().unwrap();
        assert_eq!(output.preempted, vec![c, b]);
        assert_eq!(output.scheduled.len(), 1);
        assert_eq!(output.scheduled[0].id, a);

        let waiting: Vec<RequestId> = sched.waiting.iter().map(|r| r.id).collect();
        assert_eq!(waiting, vec![b, c]);
    }
}
