use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use weft::error::Error;
use weft::executor::{DefaultExecutorHandler, Executor, ExecutorHandler, ExecutorPool};
use weft::message::{
    batch_exec_factory, message_factory, BatchRequest, BatchType, Message, MessageType,
};
use weft::scheduler::{scheduler, HostResources};
use weft::testing::clean_fabric;

const SHORT_TIMEOUT: Duration = Duration::from_millis(200);

fn test_executor(handler: Arc<dyn ExecutorHandler>) -> Executor {
    let mut executor = Executor::new(0, handler);
    executor.set_timeouts(SHORT_TIMEOUT, SHORT_TIMEOUT);
    executor
}

#[derive(Default)]
struct RecordingHandler {
    executed: AtomicU32,
    flushed: AtomicBool,
    bound: AtomicBool,
    fail: AtomicBool,
    reject_bind: AtomicBool,
}

impl ExecutorHandler for RecordingHandler {
    fn is_valid_function(&self, _msg: &Message) -> bool {
        !self.reject_bind.load(Ordering::SeqCst)
    }

    fn do_execute(&self, msg: &mut Message) -> weft::Result<bool> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::InvalidFunction(msg.function.clone()));
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
        msg.output_data = "success".to_string();
        Ok(true)
    }

    fn execute_thread(&self, _pool_idx: usize, _req: &BatchRequest, msg: &mut Message) -> i32 {
        self.executed.fetch_add(1, Ordering::SeqCst);
        msg.app_index
    }

    fn post_bind(&self, _msg: &Message, _force: bool) {
        self.bound.store(true, Ordering::SeqCst);
    }

    fn flush(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }
}

#[test]
#[serial]
fn test_binding_rules() {
    clean_fabric();

    let handler = Arc::new(RecordingHandler::default());
    let mut executor = test_executor(handler.clone());

    assert!(!executor.is_bound());

    let msg = message_factory("demo", "echo");
    executor.bind_to_function(&msg, false).unwrap();
    assert!(executor.is_bound());
    assert!(handler.bound.load(Ordering::SeqCst));

    // Binding a second time is an error
    assert!(matches!(
        executor.bind_to_function(&msg, false),
        Err(Error::AlreadyBound)
    ));

    // Force-binding to the same function is fine
    executor.bind_to_function(&msg, true).unwrap();

    // Force-binding to a different one is not
    let other = message_factory("demo", "other");
    assert!(matches!(
        executor.bind_to_function(&other, true),
        Err(Error::ForceBindMismatch)
    ));
}

#[test]
#[serial]
fn test_invalid_function_leaves_executor_unbound() {
    clean_fabric();

    let handler = Arc::new(RecordingHandler::default());
    handler.reject_bind.store(true, Ordering::SeqCst);

    let mut executor = test_executor(handler);

    let msg = message_factory("demo", "invalid");
    scheduler().call_function(msg).unwrap();

    // The bind message is consumed but the executor stays unbound
    executor.process_next_message().unwrap();
    assert!(!executor.is_bound());
}

#[test]
#[serial]
fn test_executing_single_call() {
    clean_fabric();

    let sch = scheduler();
    sch.set_this_host_resources(HostResources {
        cores: 4,
        ..Default::default()
    });

    let msg = message_factory("demo", "echo");
    sch.call_function(msg.clone()).unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut executor = test_executor(handler.clone());

    // First message binds, second executes
    executor.process_next_message().unwrap();
    assert!(executor.is_bound());
    executor.process_next_message().unwrap();

    assert_eq!(handler.executed.load(Ordering::SeqCst), 1);
    assert_eq!(executor.execution_count, 1);

    // The result is in the store, with the finished call unblocked first
    let result = sch.get_function_result(msg.id, 1000).unwrap();
    assert_eq!(result.msg_type, MessageType::Call);
    assert_eq!(result.return_value, 0);
    assert_eq!(result.output_data, "success");
    assert_eq!(sch.get_function_in_flight_count(&msg), 0);
}

#[test]
#[serial]
fn test_user_code_fault_surfaces_error() {
    clean_fabric();

    let sch = scheduler();
    sch.set_this_host_resources(HostResources {
        cores: 4,
        ..Default::default()
    });

    let msg = message_factory("demo", "boom");
    sch.call_function(msg.clone()).unwrap();

    let handler = Arc::new(RecordingHandler::default());
    handler.fail.store(true, Ordering::SeqCst);

    let mut executor = test_executor(handler);
    executor.process_next_message().unwrap();
    executor.process_next_message().unwrap();

    let result = sch.get_function_result(msg.id, 1000).unwrap();
    assert_eq!(result.return_value, 1);
    assert!(result.output_data.starts_with("Error:"));
}

#[test]
#[serial]
fn test_flush_hook() {
    clean_fabric();

    let sch = scheduler();
    let handler = Arc::new(RecordingHandler::default());
    let mut executor = test_executor(handler.clone());

    let mut msg = message_factory("demo", "echo");
    executor.bind_to_function(&msg, false).unwrap();

    msg.msg_type = MessageType::Flush;
    let req = Arc::new(batch_exec_factory(vec![msg.clone()]));
    sch.get_function_queue(&msg).enqueue((vec![0], req));

    executor.process_next_message().unwrap();
    assert!(handler.flushed.load(Ordering::SeqCst));
    assert_eq!(handler.executed.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn test_batch_thread_execution() {
    clean_fabric();

    let sch = scheduler();
    let handler = Arc::new(RecordingHandler::default());
    let mut executor = test_executor(handler.clone());

    let bind_msg = message_factory("demo", "threaded");
    executor.bind_to_function(&bind_msg, false).unwrap();

    // A batch of thread messages routed by app index
    let n_threads = 4;
    let mut msgs = Vec::new();
    for i in 0..n_threads {
        let mut msg = message_factory("demo", "threaded");
        msg.app_index = i;
        msgs.push(msg);
    }
    let ids: Vec<u64> = msgs.iter().map(|m| m.id).collect();

    let mut req = batch_exec_factory(msgs);
    req.batch_type = BatchType::Threads;
    sch.get_function_queue(&bind_msg)
        .enqueue(((0..n_threads as usize).collect(), Arc::new(req)));

    executor.process_next_message().unwrap();

    // Joining the pool guarantees all thread results are set
    executor.finish();

    assert_eq!(handler.executed.load(Ordering::SeqCst), n_threads as u32);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(sch.get_thread_result(*id).unwrap(), i as i32);
    }
}

#[test]
#[serial]
fn test_timeout_finishes_executor() {
    clean_fabric();

    let sch = scheduler();
    sch.set_this_host_resources(HostResources {
        cores: 4,
        ..Default::default()
    });

    let msg = message_factory("demo", "echo");
    sch.call_function(msg.clone()).unwrap();

    let resources_before = sch.get_this_host_resources();
    assert_eq!(resources_before.bound_executors, 1);

    // Bind, execute the one call, then time out and finish
    let handler = Arc::new(RecordingHandler::default());
    let mut executor = test_executor(handler);
    executor.run();

    assert_eq!(sch.get_function_faaslet_count(&msg), 0);
    let resources_after = sch.get_this_host_resources();
    assert_eq!(resources_after.bound_executors, 0);
}

#[test]
#[serial]
fn test_executor_pool_runs_scheduled_calls() {
    clean_fabric();

    let sch = scheduler();
    sch.set_this_host_resources(HostResources {
        cores: 4,
        ..Default::default()
    });

    let mut msgs = Vec::new();
    for _ in 0..3 {
        let msg = message_factory("demo", "echo");
        sch.call_function(msg.clone()).unwrap();
        msgs.push(msg);
    }

    let pool = ExecutorPool::start_with_timeouts(
        2,
        || Arc::new(DefaultExecutorHandler) as Arc<dyn ExecutorHandler>,
        SHORT_TIMEOUT,
        SHORT_TIMEOUT,
    );
    pool.join();

    for msg in &msgs {
        let result = sch.get_function_result(msg.id, 1000).unwrap();
        assert_eq!(result.msg_type, MessageType::Call);
        assert_eq!(result.return_value, 0);
    }
}
