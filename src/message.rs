use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

lazy_static! {
    // High half is a per-process random prefix so IDs stay globally unique
    // across hosts, low half is monotonic within the process.
    static ref GID_PREFIX: u64 = (rand::random::<u32>() as u64) << 32;
    static ref GID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Generate a 64-bit globally unique, process-monotonic ID
pub fn generate_gid() -> u64 {
    *GID_PREFIX | GID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Empty,
    Call,
    Bind,
    Kill,
    Flush,
}

/// A unit of invocation.
///
/// Identity is immutable once assigned by [`set_message_id`]; result fields
/// are set exactly once at completion.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: u64,
    pub msg_type: MessageType,

    pub user: String,
    pub function: String,
    pub is_python: bool,
    pub python_user: String,
    pub python_function: String,

    pub master_host: String,
    pub executed_host: String,

    pub input_data: Vec<u8>,
    pub cmdline: String,

    pub return_value: i32,
    pub output_data: String,
    pub timestamp: u64,
    pub finish_timestamp: u64,

    pub is_mpi: bool,
    pub mpi_world_id: i32,
    pub mpi_world_size: i32,
    pub mpi_rank: i32,
    pub app_index: i32,

    pub snapshot_key: String,

    pub result_key: String,
    pub status_key: String,
}

pub fn result_key_from_message_id(id: u64) -> String {
    format!("result_{}", id)
}

pub fn status_key_from_message_id(id: u64) -> String {
    format!("status_{}", id)
}

/// Assign an ID, the derived status/result keys and a creation timestamp.
/// Idempotent: a message that already carries an ID is left untouched.
pub fn set_message_id(msg: &mut Message) {
    if msg.id > 0 {
        return;
    }

    msg.id = generate_gid();
    msg.result_key = result_key_from_message_id(msg.id);
    msg.status_key = status_key_from_message_id(msg.id);
    msg.timestamp = epoch_millis();
}

/// Build a message addressed at `{user, function}` with this host as master
pub fn message_factory(user: &str, function: &str) -> Message {
    let mut msg = Message {
        user: user.to_owned(),
        function: function.to_owned(),
        master_host: crate::env_var::config().endpoint_host.clone(),
        ..Default::default()
    };
    set_message_id(&mut msg);
    msg
}

pub fn func_to_string(msg: &Message, include_id: bool) -> String {
    if include_id {
        format!("{}/{}:{}", msg.user, msg.function, msg.id)
    } else {
        format!("{}/{}", msg.user, msg.function)
    }
}

/// Argv for a message: the function name followed by the cmdline tokens
pub fn get_argv_for_message(msg: &Message) -> Vec<String> {
    let mut argv = vec![msg.function.clone()];
    argv.extend(
        msg.cmdline
            .split_whitespace()
            .map(|token| token.to_owned()),
    );
    argv
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    /// Each message is an independent invocation
    #[default]
    Functions,
    /// Execute in-process on a bound executor's thread pool, sharing memory
    /// via a named snapshot
    Threads,
    /// Each message is a process; all share a snapshot
    Processes,
}

/// An ordered list of messages admitted as one unit
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    pub id: u64,
    pub batch_type: BatchType,
    pub messages: Vec<Message>,
}

pub fn batch_exec_factory(messages: Vec<Message>) -> BatchRequest {
    BatchRequest {
        id: generate_gid(),
        batch_type: BatchType::Functions,
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_factory() {
        let msg = message_factory("demo", "echo");
        assert_eq!(msg.user, "demo");
        assert_eq!(msg.function, "echo");
        assert!(msg.id > 0);
        assert!(!msg.status_key.is_empty());
        assert!(!msg.result_key.is_empty());
        assert_eq!(msg.master_host, crate::env_var::config().endpoint_host);
    }

    #[test]
    fn test_adding_id_to_message() {
        let mut msg_a = Message::default();
        let mut msg_b = Message::default();

        assert_eq!(msg_a.id, 0);
        assert!(msg_a.result_key.is_empty());
        assert!(msg_a.status_key.is_empty());

        set_message_id(&mut msg_a);
        set_message_id(&mut msg_b);

        assert!(msg_a.id > 0);
        assert!(msg_b.id > msg_a.id);

        assert_eq!(msg_a.result_key, format!("result_{}", msg_a.id));
        assert_eq!(msg_a.status_key, format!("status_{}", msg_a.id));
        assert!(msg_a.timestamp > 0);
    }

    #[test]
    fn test_setting_id_twice_is_idempotent() {
        let mut msg = message_factory("demo", "echo");
        let id = msg.id;
        let result_key = msg.result_key.clone();
        let status_key = msg.status_key.clone();
        let timestamp = msg.timestamp;

        set_message_id(&mut msg);

        assert_eq!(msg.id, id);
        assert_eq!(msg.result_key, result_key);
        assert_eq!(msg.status_key, status_key);
        assert_eq!(msg.timestamp, timestamp);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_argv_for_message() {
        let mut msg = message_factory("demo", "mpi_bench");
        msg.cmdline = "  2   5 ".to_owned();

        let argv = get_argv_for_message(&msg);
        assert_eq!(argv, vec!["mpi_bench", "2", "5"]);
    }

    #[test]
    fn test_batch_exec_factory() {
        let msgs = vec![
            message_factory("demo", "echo"),
            message_factory("demo", "echo"),
        ];
        let req = batch_exec_factory(msgs);
        assert!(req.id > 0);
        assert_eq!(req.batch_type, BatchType::Functions);
        assert_eq!(req.messages.len(), 2);
    }
}
