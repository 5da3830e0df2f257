use rayon::{ThreadPoolBuildError, ThreadPoolBuilder};
use log::info;

// A wrapper around Rayon's ThreadPool used for chunk IO and per-observer work.
// An inline pool runs every job on the calling thread, which keeps tests deterministic.
pub struct ThreadPool {
    pool: Option<rayon::ThreadPool>,
    num_threads: usize,
}

impl ThreadPool {
    // A size of 0 means one worker per logical CPU
    pub fn new(size: usize) -> Result<ThreadPool, ThreadPoolBuildError> {
        let num_threads = if size > 0 { size } else { num_cpus::get() };

        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("worldtick-worker-{}", i))
            .build()?;

        info!("Created thread pool with {} threads", num_threads);

        Ok(ThreadPool {
            pool: Some(pool),
            num_threads,
        })
    }

    // Runs everything synchronously on the caller's thread
    pub fn inline() -> ThreadPool {
        ThreadPool {
            pool: None,
            num_threads: 1,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.pool.is_none()
    }

    // Fire-and-forget; inline pools run the job before returning
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.pool {
            Some(pool) => pool.spawn(f),
            None => f(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    // Maps `f` over `data`, keeping input order in the output
    pub fn par_execute<T, F, R>(&self, data: &[T], f: F) -> Vec<R>
    where
        T: Send + Sync,
        F: Fn(&T) -> R + Send + Sync,
        R: Send,
    {
        use rayon::prelude::*;
        match &self.pool {
            Some(pool) => pool.install(|| data.par_iter().map(f).collect()),
            None => data.iter().map(f).collect(),
        }
    }

    // Same as par_execute but hands each worker exclusive access to its item
    pub fn par_execute_mut<T, F, R>(&self, data: &mut [T], f: F) -> Vec<R>
    where
        T: Send,
        F: Fn(&mut T) -> R + Send + Sync,
        R: Send,
    {
        use rayon::prelude::*;
        match &self.pool {
            Some(pool) => pool.install(|| data.par_iter_mut().map(f).collect()),
            None => data.iter_mut().map(f).collect(),
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("inline", &self.is_inline())
            .finish()
    }
}
