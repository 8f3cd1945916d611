use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::env_var::{config, usable_cores};
use crate::error::{Error, Result};
use crate::message::{
    func_to_string, generate_gid, BatchRequest, BatchType, Message, MessageType,
};
use crate::queue::TimedQueue;
use crate::scheduler::{scheduler, MessageTask};

/// Extension points filled in by concrete executors. Every hook defaults to
/// a no-op success; implementations override only what they need.
///
/// `do_execute` and `execute_thread` run user code: `do_execute` on the
/// executor's own thread, `execute_thread` concurrently on the internal pool.
pub trait ExecutorHandler: Send + Sync {
    fn is_valid_function(&self, _msg: &Message) -> bool {
        true
    }

    /// Run a single call. Returns the success flag; a returned error counts
    /// as a fault in user code.
    fn do_execute(&self, _msg: &mut Message) -> Result<bool> {
        Ok(true)
    }

    /// Run one thread of a `Threads` batch, returning its exit value
    fn execute_thread(&self, _pool_idx: usize, _req: &BatchRequest, _msg: &mut Message) -> i32 {
        0
    }

    fn post_bind(&self, _msg: &Message, _force: bool) {}

    fn pre_finish_call(&self, _msg: &Message, _success: bool, _error_msg: &str) {}

    fn post_finish_call(&self) {}

    fn post_finish(&self) {}

    fn flush(&self) {}
}

/// Executor with every hook left at its default
pub struct DefaultExecutorHandler;

impl ExecutorHandler for DefaultExecutorHandler {}

type ThreadTask = (usize, Arc<BatchRequest>);

/// A long-lived worker.
///
/// Starts unbound, polling the global bind queue. A `Bind` message pins it
/// to one `{user, function}` for the rest of its life, after which it drains
/// that function's queue. Timing out on either queue finishes it.
pub struct Executor {
    pub id: String,
    handler: Arc<dyn ExecutorHandler>,

    bound_message: Option<Message>,
    function_queue: Option<Arc<TimedQueue<MessageTask>>>,

    thread_pool_size: usize,
    thread_queues: HashMap<usize, Arc<TimedQueue<ThreadTask>>>,
    threads: HashMap<usize, thread::JoinHandle<()>>,

    bound_timeout: Duration,
    unbound_timeout: Duration,

    pub execution_count: u64,
}

impl Executor {
    pub fn new(thread_idx: usize, handler: Arc<dyn ExecutorHandler>) -> Executor {
        // The executor thread itself is executing, so one less for the pool
        let thread_pool_size = usable_cores().saturating_sub(1).max(1);

        let id = format!("{}_{}", config().endpoint_host, thread_idx);
        debug!("starting executor {}", id);

        Executor {
            id,
            handler,
            bound_message: None,
            function_queue: None,
            thread_pool_size,
            thread_queues: HashMap::new(),
            threads: HashMap::new(),
            bound_timeout: Duration::from_millis(config().bound_timeout_ms),
            unbound_timeout: Duration::from_millis(config().unbound_timeout_ms),
            execution_count: 0,
        }
    }

    /// Override the queue timeouts, mainly to keep tests snappy
    pub fn set_timeouts(&mut self, bound: Duration, unbound: Duration) {
        self.bound_timeout = bound;
        self.unbound_timeout = unbound;
    }

    pub fn is_bound(&self) -> bool {
        self.bound_message.is_some()
    }

    /// Pin this executor to the message's `{user, function}`.
    ///
    /// Binding twice is an error unless forced onto the same function.
    pub fn bind_to_function(&mut self, msg: &Message, force: bool) -> Result<()> {
        if let Some(bound) = &self.bound_message {
            if !force {
                return Err(Error::AlreadyBound);
            }
            if bound.user != msg.user || bound.function != msg.function {
                return Err(Error::ForceBindMismatch);
            }
        }

        if !self.handler.is_valid_function(msg) {
            return Err(Error::InvalidFunction(func_to_string(msg, false)));
        }

        self.function_queue = Some(scheduler().get_function_queue(msg));
        self.bound_message = Some(msg.clone());

        self.handler.post_bind(msg, force);
        Ok(())
    }

    /// Main loop: process messages until a queue timeout finishes us off
    pub fn run(&mut self) {
        loop {
            debug!("{} waiting for next message", self.id);
            match self.process_next_message() {
                Ok(()) => {}
                Err(Error::Timeout) => {
                    debug!("{} got no messages, finishing", self.id);
                    break;
                }
                Err(e) => {
                    error!("{} dropping out: {}", self.id, e);
                    break;
                }
            }
        }

        self.finish();
    }

    pub fn process_next_message(&mut self) -> Result<()> {
        if let Some(queue) = self.function_queue.clone() {
            let (message_idxs, req) = queue.dequeue(Some(self.bound_timeout))?;
            let func_str = func_to_string(&req.messages[message_idxs[0]], false);

            if req.batch_type == BatchType::Threads {
                debug!("{} batch {} threads of {}", self.id, message_idxs.len(), func_str);
                self.batch_execute_threads(message_idxs, req);
            } else if message_idxs.len() == 1 {
                debug!("{} executing single {} message", self.id, func_str);
                let msg = req.messages[message_idxs[0]].clone();

                if msg.msg_type == MessageType::Flush {
                    self.handler.flush();
                } else {
                    self.execute_call(msg);
                }
            } else {
                error!(
                    "{} got {} x {} messages but not in thread mode",
                    self.id,
                    message_idxs.len(),
                    func_str
                );
                return Err(Error::UnsupportedBatch(message_idxs.len()));
            }
        } else {
            let bind_msg = scheduler()
                .get_bind_queue()
                .dequeue(Some(self.unbound_timeout))?;
            debug!("{} binding to {}", self.id, func_to_string(&bind_msg, false));

            // An invalid function is surfaced but not fatal, the executor
            // stays unbound
            if let Err(Error::InvalidFunction(func)) = self.bind_to_function(&bind_msg, false) {
                error!("{} asked to bind to invalid function {}", self.id, func);
            }
        }

        Ok(())
    }

    fn execute_call(&mut self, mut msg: Message) {
        let mut error_msg = String::new();
        let success = match self.handler.do_execute(&mut msg) {
            Ok(success) => success,
            Err(e) => {
                error_msg = format!("Error: {}", e);
                error!("{}", error_msg);
                msg.return_value = 1;
                false
            }
        };

        if !success && error_msg.is_empty() {
            error_msg = format!("Call failed (return value={})", msg.return_value);
        }

        self.finish_call(msg, success, &error_msg);
    }

    fn finish_call(&mut self, mut msg: Message, success: bool, error_msg: &str) {
        self.handler.pre_finish_call(&msg, success, error_msg);

        info!("finished {}", func_to_string(&msg, true));
        if !success {
            msg.output_data = error_msg.to_owned();
        }

        // Notify the scheduler *before* setting the result. Calls awaiting
        // the result carry on blocking.
        scheduler().notify_call_finished(&msg);
        scheduler().set_function_result(&mut msg);

        self.execution_count += 1;

        self.handler.post_finish_call();
    }

    fn batch_execute_threads(&mut self, message_idxs: Vec<usize>, req: Arc<BatchRequest>) {
        info!(
            "batch executing {}/{} threads of {}",
            message_idxs.len(),
            req.messages.len(),
            func_to_string(&req.messages[0], false)
        );

        for msg_idx in message_idxs {
            let msg = &req.messages[msg_idx];
            let pool_idx = (msg.app_index.unsigned_abs() as usize) % self.thread_pool_size;

            let queue = self
                .thread_queues
                .entry(pool_idx)
                .or_insert_with(|| Arc::new(TimedQueue::new()))
                .clone();
            queue.enqueue((msg_idx, req.clone()));

            if !self.threads.contains_key(&pool_idx) {
                let handler = self.handler.clone();
                let worker_queue = queue.clone();
                let handle = thread::spawn(move || {
                    debug!("thread pool thread {} starting up", pool_idx);

                    loop {
                        let (msg_idx, req) = match worker_queue.dequeue(None) {
                            Ok(task) => task,
                            Err(_) => break,
                        };

                        let mut msg = req.messages[msg_idx].clone();
                        if msg.msg_type == MessageType::Kill {
                            break;
                        }

                        let return_value = handler.execute_thread(pool_idx, &req, &mut msg);

                        scheduler().set_thread_result(&msg, return_value);
                        scheduler().notify_call_finished(&msg);
                    }

                    debug!("thread pool thread {} shutting down", pool_idx);
                });
                self.threads.insert(pool_idx, handle);
            }
        }
    }

    /// Shut down the internal pool and notify the scheduler if bound
    pub fn finish(&mut self) {
        if let Some(bound) = self.bound_message.take() {
            scheduler().notify_faaslet_finished(&bound);
        }

        // A kill marker per pool thread, then wait
        for queue in self.thread_queues.values() {
            let kill_req = BatchRequest {
                id: generate_gid(),
                batch_type: BatchType::Threads,
                messages: vec![Message {
                    msg_type: MessageType::Kill,
                    ..Default::default()
                }],
            };
            queue.enqueue((0, Arc::new(kill_req)));
        }

        for (_, handle) in self.threads.drain() {
            let _res = handle.join();
        }

        self.function_queue = None;
        self.handler.post_finish();
    }
}

/// A set of long-lived executor threads drawing from the global bind queue
pub struct ExecutorPool {
    threads: Vec<thread::JoinHandle<()>>,
}

impl ExecutorPool {
    /// Spawn `n_executors` executors, each with its own handler from the
    /// factory
    pub fn start<F>(n_executors: usize, factory: F) -> ExecutorPool
    where
        F: Fn() -> Arc<dyn ExecutorHandler>,
    {
        Self::start_with_timeouts(
            n_executors,
            factory,
            Duration::from_millis(config().bound_timeout_ms),
            Duration::from_millis(config().unbound_timeout_ms),
        )
    }

    pub fn start_with_timeouts<F>(
        n_executors: usize,
        factory: F,
        bound: Duration,
        unbound: Duration,
    ) -> ExecutorPool
    where
        F: Fn() -> Arc<dyn ExecutorHandler>,
    {
        let mut threads = Vec::with_capacity(n_executors);
        for i in 0..n_executors {
            let handler = factory();
            threads.push(thread::spawn(move || {
                let mut executor = Executor::new(i, handler);
                executor.set_timeouts(bound, unbound);
                executor.run();
            }));
        }
        ExecutorPool { threads }
    }

    /// Wait for every executor to finish. They drop out once their queues
    /// stay empty past the configured timeouts.
    pub fn join(self) {
        for handle in self.threads {
            let _res = handle.join();
        }
    }
}
