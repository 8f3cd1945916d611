use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::env_var::config;
use crate::error::Result;
use crate::message::{
    epoch_millis, func_to_string, generate_gid, result_key_from_message_id, BatchRequest,
    BatchType, Message, MessageType,
};
use crate::queue::TimedQueue;
use crate::snapshot;
use crate::state::global_kv;
use crate::transport::{FunctionCallClient, SnapshotClient};

/// KV set holding the cluster membership
pub const AVAILABLE_HOST_SET: &str = "available_hosts";

/// Per-host scheduling capacity.
///
/// `bound_executors <= cores` always; `functions_in_flight` may exceed
/// `cores` when the whole cluster is saturated and calls overflow locally.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HostResources {
    pub cores: u32,
    pub bound_executors: u32,
    pub functions_in_flight: u32,
}

impl HostResources {
    pub fn slots_available(&self) -> u32 {
        self.cores.saturating_sub(self.functions_in_flight)
    }
}

/// Work item handed to a bound executor: indices into the batch it should run
pub type MessageTask = (Vec<usize>, Arc<BatchRequest>);

#[derive(Default)]
struct FunctionState {
    faaslets: u32,
    in_flight: u32,
    // Warm hosts, kept in registration order for deterministic tie-breaks
    warm_hosts: Vec<String>,
}

/// The admission and dispatch engine for this host
pub struct Scheduler {
    this_host: String,
    resources: Mutex<HostResources>,
    bind_queue: Arc<TimedQueue<Message>>,
    function_queues: RwLock<HashMap<String, Arc<TimedQueue<MessageTask>>>>,
    functions: RwLock<HashMap<String, Arc<Mutex<FunctionState>>>>,
    // host -> snapshot keys it has already received
    pushed_snapshots: Mutex<HashMap<String, HashSet<String>>>,
    recorded_messages: Mutex<Vec<u64>>,
}

lazy_static! {
    static ref SCHEDULER: Scheduler = Scheduler::new();
}

/// The process-wide scheduler
pub fn scheduler() -> &'static Scheduler {
    &SCHEDULER
}

impl Scheduler {
    fn new() -> Scheduler {
        Scheduler {
            this_host: config().endpoint_host.clone(),
            resources: Mutex::new(HostResources {
                cores: config().cores,
                ..Default::default()
            }),
            bind_queue: Arc::new(TimedQueue::new()),
            function_queues: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            pushed_snapshots: Mutex::new(HashMap::new()),
            recorded_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn get_this_host(&self) -> String {
        self.this_host.clone()
    }

    fn function_state(&self, msg: &Message) -> Arc<Mutex<FunctionState>> {
        let key = func_to_string(msg, false);
        {
            let states = self.functions.read();
            if let Some(state) = states.get(&key) {
                return state.clone();
            }
        }
        let mut states = self.functions.write();
        states.entry(key).or_default().clone()
    }

    // ------------------------------------------
    // Host membership
    // ------------------------------------------

    pub fn add_host_to_global_set(&self, host: &str) {
        global_kv().set_add(AVAILABLE_HOST_SET, host);
    }

    pub fn remove_host_from_global_set(&self, host: &str) {
        global_kv().set_remove(AVAILABLE_HOST_SET, host);
    }

    /// All known hosts, this one included
    pub fn get_available_hosts(&self) -> HashSet<String> {
        let mut hosts: HashSet<String> = global_kv()
            .set_members(AVAILABLE_HOST_SET)
            .into_iter()
            .collect();
        hosts.insert(self.this_host.clone());
        hosts
    }

    // ------------------------------------------
    // Resources
    // ------------------------------------------

    pub fn set_this_host_resources(&self, resources: HostResources) {
        *self.resources.lock() = resources;
    }

    pub fn get_this_host_resources(&self) -> HostResources {
        self.resources.lock().clone()
    }

    // ------------------------------------------
    // Admission
    // ------------------------------------------

    /// Shortcut for a one-message batch. Fresh parallel jobs (MPI flag, rank
    /// zero, no world yet) get their world ID assigned here, before dispatch.
    pub fn call_function(&self, mut msg: Message) -> Result<()> {
        if msg.is_mpi && msg.mpi_rank == 0 && msg.mpi_world_id == 0 {
            msg.mpi_world_id = ((generate_gid() as i32) & i32::MAX).max(1);
            debug!("assigned world {} to {}", msg.mpi_world_id, msg.id);
        }

        let req = BatchRequest {
            id: generate_gid(),
            batch_type: BatchType::Functions,
            messages: vec![msg],
        };
        self.call_functions(req)?;
        Ok(())
    }

    /// Schedule every message of a batch.
    ///
    /// Returns one host identifier per message, in batch order: empty string
    /// for inline execution (threads, or a batch bounced to its master),
    /// this host's identifier for a local binding, any other value for a
    /// forward.
    pub fn call_functions(&self, req: BatchRequest) -> Result<Vec<String>> {
        let n_messages = req.messages.len();
        if n_messages == 0 {
            return Ok(Vec::new());
        }

        // A batch not meant for this host goes back to its master untouched
        let master_host = req.messages[0].master_host.clone();
        if !master_host.is_empty() && master_host != self.this_host {
            debug!("returning batch {} to master {}", req.id, master_host);
            FunctionCallClient::new(&master_host).forward_batch(&req)?;
            return Ok(vec![String::new(); n_messages]);
        }

        if crate::testing::is_test_mode() {
            let mut recorded = self.recorded_messages.lock();
            for msg in &req.messages {
                recorded.push(msg.id);
            }
        }

        let is_threads = req.batch_type == BatchType::Threads;
        let first_msg = req.messages[0].clone();
        let func_str = func_to_string(&first_msg, false);
        debug!(
            "scheduling {} x {} ({:?})",
            n_messages, func_str, req.batch_type
        );

        let mut executed_hosts = vec![String::new(); n_messages];
        let mut local_idxs: Vec<usize> = Vec::new();
        let mut remaining: Vec<usize> = Vec::new();

        // Claim local slots first
        {
            let mut resources = self.resources.lock();
            for i in 0..n_messages {
                if resources.slots_available() > 0 {
                    resources.functions_in_flight += 1;
                    local_idxs.push(i);
                } else {
                    remaining.push(i);
                }
            }
        }

        // Spill the rest onto warm hosts first, then the wider membership
        if !remaining.is_empty() {
            for host in self.remote_candidates(&first_msg) {
                if remaining.is_empty() {
                    break;
                }

                let resources = match FunctionCallClient::new(&host).request_resources() {
                    Ok(r) => r,
                    Err(e) => {
                        // Unreachable host counts as no capacity
                        warn!("failed resource request to {}: {}", host, e);
                        continue;
                    }
                };

                let slots = resources.slots_available() as usize;
                if slots == 0 {
                    continue;
                }

                let n_on_host = slots.min(remaining.len());
                let offloaded: Vec<usize> = remaining.drain(..n_on_host).collect();

                if let Err(e) = self.forward_to_host(&host, &req, &offloaded) {
                    error!("failed forwarding {} calls to {}: {}", n_on_host, host, e);
                    continue;
                }

                for &i in &offloaded {
                    executed_hosts[i] = host.clone();
                }
                self.register_warm_host(&host, &first_msg);
            }
        }

        // Overloaded: whatever found no home anywhere still runs here. The
        // in-flight count keeps growing but no executor beyond the core
        // count is created.
        if !remaining.is_empty() {
            info!(
                "overloading {} calls of {} onto this host",
                remaining.len(),
                func_str
            );
            let mut resources = self.resources.lock();
            resources.functions_in_flight += remaining.len() as u32;
            local_idxs.append(&mut remaining);
        }

        // Dispatch the local share
        if !local_idxs.is_empty() {
            let state = self.function_state(&first_msg);
            let mut state = state.lock();
            state.in_flight += local_idxs.len() as u32;

            if is_threads {
                // The caller executes threads inline on its own pool
                for &i in &local_idxs {
                    executed_hosts[i] = String::new();
                }
            } else {
                for &i in &local_idxs {
                    executed_hosts[i] = self.this_host.clone();

                    let mut bind_msg = req.messages[i].clone();
                    bind_msg.msg_type = MessageType::Bind;
                    self.bind_queue.enqueue(bind_msg);
                    state.faaslets += 1;

                    let mut resources = self.resources.lock();
                    if resources.bound_executors < resources.cores {
                        resources.bound_executors += 1;
                    }
                }

                let queue = self.get_function_queue(&first_msg);
                queue.enqueue((local_idxs, Arc::new(req)));
            }
        }

        Ok(executed_hosts)
    }

    /// Warm hosts in registration order, then the rest of the membership
    fn remote_candidates(&self, msg: &Message) -> Vec<String> {
        let mut candidates = self.get_function_registered_hosts(msg);
        for host in self.get_available_hosts() {
            if host != self.this_host && !candidates.contains(&host) {
                candidates.push(host);
            }
        }
        candidates
    }

    fn forward_to_host(&self, host: &str, req: &BatchRequest, idxs: &[usize]) -> Result<()> {
        // Thread and process batches restore memory from a snapshot, which
        // must land on the host before any of its messages do
        let snapshot_key = &req.messages[idxs[0]].snapshot_key;
        if req.batch_type != BatchType::Functions && !snapshot_key.is_empty() {
            let mut pushed = self.pushed_snapshots.lock();
            let host_keys = pushed.entry(host.to_owned()).or_default();
            if !host_keys.contains(snapshot_key) {
                let snapshot = snapshot::get_snapshot(snapshot_key)?;
                SnapshotClient::new(host).push_snapshot(snapshot_key, &snapshot)?;
                host_keys.insert(snapshot_key.clone());
            }
        }

        let sub_req = BatchRequest {
            id: req.id,
            batch_type: req.batch_type,
            messages: idxs.iter().map(|&i| req.messages[i].clone()).collect(),
        };
        FunctionCallClient::new(host).forward_batch(&sub_req)
    }

    // ------------------------------------------
    // Warm host registry
    // ------------------------------------------

    fn register_warm_host(&self, host: &str, msg: &Message) {
        let state = self.function_state(msg);
        let mut state = state.lock();
        if !state.warm_hosts.iter().any(|h| h == host) {
            state.warm_hosts.push(host.to_owned());
        }
    }

    pub fn get_function_registered_hosts(&self, msg: &Message) -> Vec<String> {
        self.function_state(msg).lock().warm_hosts.clone()
    }

    pub fn get_function_registered_host_count(&self, msg: &Message) -> usize {
        self.function_state(msg).lock().warm_hosts.len()
    }

    /// Forget a warm host for one function. Other functions keep their sets.
    pub fn remove_registered_host(&self, host: &str, msg: &Message) {
        let state = self.function_state(msg);
        state.lock().warm_hosts.retain(|h| h != host);
    }

    // ------------------------------------------
    // Queues and counters
    // ------------------------------------------

    pub fn get_bind_queue(&self) -> Arc<TimedQueue<Message>> {
        self.bind_queue.clone()
    }

    pub fn get_function_queue(&self, msg: &Message) -> Arc<TimedQueue<MessageTask>> {
        let key = func_to_string(msg, false);
        {
            let queues = self.function_queues.read();
            if let Some(queue) = queues.get(&key) {
                return queue.clone();
            }
        }
        let mut queues = self.function_queues.write();
        queues
            .entry(key)
            .or_insert_with(|| Arc::new(TimedQueue::new()))
            .clone()
    }

    pub fn get_function_faaslet_count(&self, msg: &Message) -> u32 {
        self.function_state(msg).lock().faaslets
    }

    pub fn get_function_in_flight_count(&self, msg: &Message) -> u32 {
        self.function_state(msg).lock().in_flight
    }

    /// A call finished somewhere on this host. Counters clamp at zero.
    pub fn notify_call_finished(&self, msg: &Message) {
        {
            let mut resources = self.resources.lock();
            resources.functions_in_flight = resources.functions_in_flight.saturating_sub(1);
        }
        let state = self.function_state(msg);
        let mut state = state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// A bound executor for this function ended. Counters clamp at zero.
    pub fn notify_faaslet_finished(&self, msg: &Message) {
        {
            let mut resources = self.resources.lock();
            resources.bound_executors = resources.bound_executors.saturating_sub(1);
        }
        let state = self.function_state(msg);
        let mut state = state.lock();
        state.faaslets = state.faaslets.saturating_sub(1);
    }

    // ------------------------------------------
    // Results
    // ------------------------------------------

    /// Stamp and publish a finished call. The result list entry unblocks
    /// pollers of [`Scheduler::get_function_result`]; the status key holds
    /// the latest blob for one-shot reads.
    pub fn set_function_result(&self, msg: &mut Message) {
        msg.finish_timestamp = epoch_millis();
        msg.executed_host = self.this_host.clone();
        msg.msg_type = MessageType::Call;

        if msg.result_key.is_empty() {
            msg.result_key = result_key_from_message_id(msg.id);
        }
        if msg.status_key.is_empty() {
            msg.status_key = crate::message::status_key_from_message_id(msg.id);
        }

        let bytes = crate::serialize(msg);
        let kv = global_kv();
        kv.append(&msg.result_key, &bytes);
        kv.set_ttl(&msg.result_key, config().result_ttl_secs);
        kv.set(&msg.status_key, &bytes);
        kv.set_ttl(&msg.status_key, config().result_ttl_secs);
    }

    /// Blocking-poll the result list for a message. A timeout yields a
    /// message of type `Empty` with no executed host.
    pub fn get_function_result(&self, message_id: u64, timeout_ms: u64) -> Result<Message> {
        let key = result_key_from_message_id(message_id);
        match global_kv().blocking_pop(&key, Duration::from_millis(timeout_ms)) {
            Ok(bytes) => crate::deserialize(&bytes),
            Err(_) => {
                trace!("timed out waiting for result of {}", message_id);
                Ok(Message {
                    id: message_id,
                    msg_type: MessageType::Empty,
                    ..Default::default()
                })
            }
        }
    }

    /// Thread results are scalar return values, distinct from full function
    /// results
    pub fn set_thread_result(&self, msg: &Message, return_value: i32) {
        let key = format!("thread_result_{}", msg.id);
        global_kv().set(&key, &return_value.to_ne_bytes());
    }

    pub fn get_thread_result(&self, message_id: u64) -> Result<i32> {
        let key = format!("thread_result_{}", message_id);
        let bytes = global_kv()
            .get(&key)
            .ok_or_else(|| crate::error::Error::KeyNotFound(key))?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        Ok(i32::from_ne_bytes(raw))
    }

    // ------------------------------------------
    // Chained functions
    // ------------------------------------------

    pub fn log_chained_function(&self, parent_id: u64, child_id: u64) {
        let key = format!("chained_{}", parent_id);
        global_kv().set_add(&key, &child_id.to_string());
    }

    pub fn get_chained_functions(&self, parent_id: u64) -> HashSet<u64> {
        let key = format!("chained_{}", parent_id);
        global_kv()
            .set_members(&key)
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect()
    }

    // ------------------------------------------
    // Snapshots
    // ------------------------------------------

    /// Delete a snapshot on exactly the hosts currently warm for this
    /// function
    pub fn broadcast_snapshot_delete(&self, msg: &Message, snapshot_key: &str) -> Result<()> {
        for host in self.get_function_registered_hosts(msg) {
            SnapshotClient::new(&host).delete_snapshot(snapshot_key)?;
        }
        Ok(())
    }

    // ------------------------------------------
    // Test recording
    // ------------------------------------------

    pub fn get_recorded_messages_all(&self) -> Vec<u64> {
        self.recorded_messages.lock().clone()
    }

    pub fn clear_recorded_messages(&self) {
        self.recorded_messages.lock().clear();
    }

    // ------------------------------------------
    // Lifecycle
    // ------------------------------------------

    /// Stop handing out work and reset all scheduling state. Executors see
    /// their queues drained and time out into `Finished`.
    pub fn shutdown(&self) {
        debug!("scheduler shutting down");
        self.bind_queue.drain();
        self.function_queues.write().clear();
        self.functions.write().clear();
        self.pushed_snapshots.lock().clear();
        self.recorded_messages.lock().clear();

        *self.resources.lock() = HostResources {
            cores: config().cores,
            ..Default::default()
        };
    }
}
