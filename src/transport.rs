use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{Error, Result};
use crate::message::BatchRequest;
use crate::mpi::MpiMessage;
use crate::scheduler::HostResources;
use crate::snapshot::SnapshotData;

/// Wire-level collaborator carrying host-to-host traffic. The codec itself
/// lives outside this crate; deployments register an implementation once at
/// startup.
pub trait Transport: Send + Sync {
    fn send_mpi_message(&self, host: &str, msg: &MpiMessage) -> Result<()>;
    fn forward_batch(&self, host: &str, req: &BatchRequest) -> Result<()>;
    fn request_resources(&self, host: &str) -> Result<HostResources>;
    fn push_snapshot(&self, host: &str, key: &str, snapshot: &SnapshotData) -> Result<()>;
    fn delete_snapshot(&self, host: &str, key: &str) -> Result<()>;
}

lazy_static! {
    static ref TRANSPORT: RwLock<Option<Arc<dyn Transport>>> = RwLock::new(None);
    static ref MOCK: Mutex<MockState> = Mutex::new(MockState::default());
}

pub fn set_transport(transport: Arc<dyn Transport>) {
    *TRANSPORT.write() = Some(transport);
}

fn transport() -> Result<Arc<dyn Transport>> {
    TRANSPORT
        .read()
        .clone()
        .ok_or_else(|| Error::Transport("no transport registered".to_owned()))
}

#[derive(Default)]
struct MockState {
    resource_requests: Vec<String>,
    batch_requests: Vec<(String, BatchRequest)>,
    mpi_messages: Vec<(String, MpiMessage)>,
    snapshot_pushes: Vec<(String, SnapshotData)>,
    snapshot_deletes: Vec<(String, String)>,
    queued_resources: HashMap<String, VecDeque<HostResources>>,
}

/// Queue a canned resource response for `host`, consumed by the next mocked
/// resource request to it
pub fn queue_resource_response(host: &str, resources: HostResources) {
    MOCK.lock()
        .queued_resources
        .entry(host.to_owned())
        .or_default()
        .push_back(resources);
}

pub fn get_resource_requests() -> Vec<String> {
    MOCK.lock().resource_requests.clone()
}

pub fn get_batch_requests() -> Vec<(String, BatchRequest)> {
    MOCK.lock().batch_requests.clone()
}

pub fn get_mpi_messages() -> Vec<(String, MpiMessage)> {
    MOCK.lock().mpi_messages.clone()
}

pub fn get_snapshot_pushes() -> Vec<(String, SnapshotData)> {
    MOCK.lock().snapshot_pushes.clone()
}

pub fn get_snapshot_deletes() -> Vec<(String, String)> {
    MOCK.lock().snapshot_deletes.clone()
}

pub fn clear_mock_requests() {
    let mut mock = MOCK.lock();
    mock.resource_requests.clear();
    mock.batch_requests.clear();
    mock.mpi_messages.clear();
    mock.snapshot_pushes.clear();
    mock.snapshot_deletes.clear();
    mock.queued_resources.clear();
}

/// Client for the function-call endpoint of one remote host.
/// Connection-per-call; constructing one is cheap.
pub struct FunctionCallClient {
    host: String,
}

impl FunctionCallClient {
    pub fn new(host: &str) -> FunctionCallClient {
        FunctionCallClient {
            host: host.to_owned(),
        }
    }

    pub fn send_mpi_message(&self, msg: &MpiMessage) -> Result<()> {
        if crate::testing::is_mock_mode() {
            MOCK.lock()
                .mpi_messages
                .push((self.host.clone(), msg.clone()));
            return Ok(());
        }
        transport()?.send_mpi_message(&self.host, msg)
    }

    pub fn forward_batch(&self, req: &BatchRequest) -> Result<()> {
        trace!("forwarding batch {} to {}", req.id, self.host);
        if crate::testing::is_mock_mode() {
            MOCK.lock()
                .batch_requests
                .push((self.host.clone(), req.clone()));
            return Ok(());
        }
        transport()?.forward_batch(&self.host, req)
    }

    pub fn request_resources(&self) -> Result<HostResources> {
        if crate::testing::is_mock_mode() {
            let mut mock = MOCK.lock();
            mock.resource_requests.push(self.host.clone());
            let response = mock
                .queued_resources
                .get_mut(&self.host)
                .and_then(|q| q.pop_front())
                .unwrap_or_default();
            return Ok(response);
        }
        transport()?.request_resources(&self.host)
    }
}

/// Client for the snapshot endpoint of one remote host
pub struct SnapshotClient {
    host: String,
}

impl SnapshotClient {
    pub fn new(host: &str) -> SnapshotClient {
        SnapshotClient {
            host: host.to_owned(),
        }
    }

    pub fn push_snapshot(&self, key: &str, snapshot: &SnapshotData) -> Result<()> {
        trace!("pushing snapshot {} to {}", key, self.host);
        if crate::testing::is_mock_mode() {
            MOCK.lock()
                .snapshot_pushes
                .push((self.host.clone(), snapshot.clone()));
            return Ok(());
        }
        transport()?.push_snapshot(&self.host, key, snapshot)
    }

    pub fn delete_snapshot(&self, key: &str) -> Result<()> {
        if crate::testing::is_mock_mode() {
            MOCK.lock()
                .snapshot_deletes
                .push((self.host.clone(), key.to_owned()));
            return Ok(());
        }
        transport()?.delete_snapshot(&self.host, key)
    }
}
