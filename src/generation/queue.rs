//! Job queue in front of the pipeline.
//!
//! The coordinator handles one request at a time, so concurrent submissions
//! are serialized here: a bounded priority queue drained by a single worker
//! thread. High-priority jobs go ahead of every normal job but keep FIFO order
//! among themselves.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{info, warn};

use super::pipeline::Pipeline;
use crate::types::{GenerationJob, JobPriority};

/// Maximum number of jobs waiting at once.
pub const MAX_QUEUE_SIZE: usize = 10;

#[derive(Debug, Default)]
struct JobQueue {
    jobs: VecDeque<GenerationJob>,
}

impl JobQueue {
    /// Inserts `job` by priority and returns its position (0 = next).
    fn push(&mut self, mut job: GenerationJob) -> Result<usize, QueueFullError> {
        if self.is_full() {
            return Err(QueueFullError {
                current_size: self.jobs.len(),
            });
        }
        let position = match job.priority {
            JobPriority::High => self
                .jobs
                .iter()
                .position(|j| j.priority != JobPriority::High)
                .unwrap_or(self.jobs.len()),
            JobPriority::Normal => self.jobs.len(),
        };
        job.set_queued();
        self.jobs.insert(position, job);
        Ok(position)
    }

    fn pop_next(&mut self) -> Option<GenerationJob> {
        self.jobs.pop_front()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn is_full(&self) -> bool {
        self.jobs.len() >= MAX_QUEUE_SIZE
    }
}

/// Error returned when the queue is full.
#[derive(Debug, Clone)]
pub struct QueueFullError {
    /// Current number of jobs in the queue.
    pub current_size: usize,
}

impl std::fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Queue is full ({} jobs). Maximum capacity is {}.",
            self.current_size, MAX_QUEUE_SIZE
        )
    }
}

impl std::error::Error for QueueFullError {}

enum Wake {
    Submitted,
    Shutdown,
}

/// Result of processing a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed; the video is at `path`.
    Complete {
        job_id: String,
        run_id: String,
        path: String,
        duration_sec: f32,
        generation_time_sec: f32,
    },
    /// Job failed; nothing was written.
    Failed {
        job_id: String,
        run_id: String,
        error_code: String,
        error_message: String,
        stage: Option<String>,
    },
}

impl JobResult {
    pub fn job_id(&self) -> &str {
        match self {
            JobResult::Complete { job_id, .. } | JobResult::Failed { job_id, .. } => job_id,
        }
    }
}

/// Runs one job through `pipeline`.
pub fn run_job(pipeline: &mut Pipeline, mut job: GenerationJob) -> JobResult {
    job.set_generating();
    let started = Instant::now();
    info!(
        "Job {} (run {}) started after {:.1}s in queue",
        job.job_id,
        job.run_id,
        job.queue_wait().as_secs_f32()
    );
    match pipeline.run(&job.input) {
        Ok(output) => JobResult::Complete {
            job_id: job.job_id,
            run_id: job.run_id,
            path: output.path.to_string_lossy().to_string(),
            duration_sec: output.duration_sec,
            generation_time_sec: started.elapsed().as_secs_f32(),
        },
        Err(e) => {
            warn!("Job {} failed: {}", job.job_id, e);
            JobResult::Failed {
                job_id: job.job_id,
                run_id: job.run_id,
                error_code: e.code.as_str().to_string(),
                error_message: e.message,
                stage: e.stage.map(|s| s.label().to_string()),
            }
        }
    }
}

fn lock(queue: &Mutex<JobQueue>) -> MutexGuard<'_, JobQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the queue and the worker thread that drains it.
pub struct QueueProcessor {
    sender: Sender<Wake>,
    thread_handle: Option<JoinHandle<()>>,
    queue: Arc<Mutex<JobQueue>>,
}

impl QueueProcessor {
    /// Starts the worker thread; `process_fn` runs once per job, serially.
    pub fn new<F>(process_fn: F) -> Self
    where
        F: FnMut(GenerationJob) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Wake>();
        let queue = Arc::new(Mutex::new(JobQueue::default()));
        let worker_queue = Arc::clone(&queue);

        let thread_handle = thread::spawn(move || {
            Self::processor_loop(receiver, worker_queue, process_fn);
        });

        Self {
            sender,
            thread_handle: Some(thread_handle),
            queue,
        }
    }

    /// Queues `job` and returns its position, or an error if the queue is full.
    pub fn submit(&self, job: GenerationJob) -> Result<usize, QueueFullError> {
        let position = lock(&self.queue).push(job)?;
        self.sender.send(Wake::Submitted).ok();
        Ok(position)
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_full(&self) -> bool {
        lock(&self.queue).is_full()
    }

    /// Stops the worker once every job submitted so far has run.
    pub fn shutdown(&mut self) {
        self.sender.send(Wake::Shutdown).ok();
        if let Some(handle) = self.thread_handle.take() {
            handle.join().ok();
        }
    }

    fn processor_loop<F>(receiver: Receiver<Wake>, queue: Arc<Mutex<JobQueue>>, mut process_fn: F)
    where
        F: FnMut(GenerationJob),
    {
        // One wake per submission, so shutdown is only seen after every
        // earlier job was popped.
        while let Ok(Wake::Submitted) = receiver.recv() {
            let job = lock(&queue).pop_next();
            if let Some(job) = job {
                process_fn(job);
            }
        }
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DialogueInput, GenerationParams, JobStatus, VoiceProfile};
    use std::path::PathBuf;

    fn create_test_job(priority: JobPriority) -> GenerationJob {
        let input = DialogueInput {
            script: "(s1) hi (s2) hello".to_string(),
            portrait1: PathBuf::from("a.png"),
            portrait2: PathBuf::from("b.png"),
            voices: vec![
                VoiceProfile::new(1, "alice", 24_000),
                VoiceProfile::new(2, "bob", 24_000),
            ],
            prompt: String::new(),
            params: GenerationParams::default(),
            output_path: PathBuf::from("out.mp4"),
        };
        GenerationJob::new(input, priority)
    }

    fn drain_ids(queue: &mut JobQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_next()).map(|j| j.job_id).collect()
    }

    #[test]
    fn high_priority_jobs_go_first_in_fifo_order() {
        let mut queue = JobQueue::default();
        let jobs: Vec<_> = [
            JobPriority::Normal,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::High,
        ]
        .into_iter()
        .map(create_test_job)
        .collect();
        let ids: Vec<_> = jobs.iter().map(|j| j.job_id.clone()).collect();

        let positions: Vec<_> = jobs.into_iter().map(|j| queue.push(j).unwrap()).collect();
        assert_eq!(positions, vec![0, 1, 0, 1]);
        assert_eq!(
            drain_ids(&mut queue),
            vec![ids[2].clone(), ids[3].clone(), ids[0].clone(), ids[1].clone()]
        );
    }

    #[test]
    fn queued_jobs_are_marked_queued() {
        let mut queue = JobQueue::default();
        queue.push(create_test_job(JobPriority::Normal)).unwrap();
        assert_eq!(queue.pop_next().unwrap().status, JobStatus::Queued);
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn full_queue_rejects() {
        let mut queue = JobQueue::default();
        for _ in 0..MAX_QUEUE_SIZE {
            queue.push(create_test_job(JobPriority::Normal)).unwrap();
        }
        assert!(queue.is_full());
        let err = queue.push(create_test_job(JobPriority::High)).unwrap_err();
        assert_eq!(err.current_size, MAX_QUEUE_SIZE);
        assert_eq!(queue.len(), MAX_QUEUE_SIZE);
    }

    #[test]
    fn processor_runs_jobs_in_order_and_drains_on_shutdown() {
        let (tx, rx) = mpsc::channel();
        let mut processor = QueueProcessor::new(move |job: GenerationJob| {
            tx.send(job.job_id).unwrap();
        });
        let a = create_test_job(JobPriority::Normal);
        let b = create_test_job(JobPriority::Normal);
        let (a_id, b_id) = (a.job_id.clone(), b.job_id.clone());
        processor.submit(a).unwrap();
        processor.submit(b).unwrap();
        processor.shutdown();

        let ran: Vec<String> = rx.try_iter().collect();
        assert_eq!(ran, vec![a_id, b_id]);
        assert_eq!(processor.queue_len(), 0);
    }
}
