use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Receiver;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::env_var::{config, usable_cores};
use crate::error::{Error, Result};
use crate::message::{generate_gid, message_factory, Message};
use crate::mpi::async_pool::{JobResult, MpiAsyncPool};
use crate::mpi::{
    check_send_recv_match, op_reduce, rank_state_key, window_state_key, world_state_key,
    MpiDatatype, MpiMessage, MpiMessageType, MpiOp, MpiStatus, MPI_SUCCESS,
};
use crate::queue::TimedQueue;
use crate::scheduler::scheduler;
use crate::state::global_kv;
use crate::transport::FunctionCallClient;

thread_local! {
    // One awaiter per request, on the thread that posted it
    static FUTURES: RefCell<HashMap<u64, Receiver<JobResult>>> = RefCell::new(HashMap::new());
}

// Registered RMA window memory. The owner keeps the buffer alive for the
// lifetime of the window, see MpiWorld::create_window.
struct WindowPtr {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for WindowPtr {}
unsafe impl Sync for WindowPtr {}

#[derive(Default)]
struct WorldState {
    rank_host_map: HashMap<i32, String>,
    local_queues: HashMap<(i32, i32), Arc<TimedQueue<MpiMessage>>>,
    windows: HashMap<String, WindowPtr>,
}

/// The shareable half of a world: identity scalars plus the lock-guarded
/// maps. Cloning is cheap, so non-blocking requests can capture a core by
/// value and run on the async pool.
#[derive(Clone)]
pub(crate) struct WorldCore {
    id: i32,
    size: i32,
    user: String,
    function: String,
    this_host: String,
    state: Arc<RwLock<WorldState>>,
    cart_procs_per_dim: Arc<Mutex<[i32; 2]>>,
}

/// Per-job state for one parallel job.
///
/// Rank 0 builds a world with [`MpiWorld::create`], which persists the world
/// size, registers itself and dispatches one chained invocation per other
/// rank. Those ranks hydrate their own instance with
/// [`MpiWorld::initialise_from_state`]. From then on the world mediates all
/// inter-rank communication, transparently across colocated and remote
/// ranks.
pub struct MpiWorld {
    core: WorldCore,
    pool: Option<Arc<MpiAsyncPool>>,
    created: Instant,
}

impl MpiWorld {
    pub fn new() -> MpiWorld {
        MpiWorld {
            core: WorldCore {
                id: -1,
                size: -1,
                user: String::new(),
                function: String::new(),
                this_host: config().endpoint_host.clone(),
                state: Arc::new(RwLock::new(WorldState::default())),
                cart_procs_per_dim: Arc::new(Mutex::new([0, 0])),
            },
            pool: None,
            created: Instant::now(),
        }
    }

    /// Pretend to be a different host, so one process can stand in for
    /// several cluster members under test
    pub fn override_host(&mut self, host: &str) {
        self.core.this_host = host.to_owned();
    }

    /// Create the world as rank 0 and dispatch the sibling invocations
    pub fn create(&mut self, call: &Message, new_id: i32, new_size: i32) -> Result<()> {
        self.core.id = new_id;
        self.core.user = call.user.clone();
        self.core.function = call.function.clone();
        self.core.size = new_size;

        self.pool = Some(Arc::new(MpiAsyncPool::new(self.thread_pool_size())));

        // Write the world state before anyone can try to read it
        self.push_to_state()?;

        // Register this as the master
        self.register_rank(0)?;

        // Dispatch the chained calls. With the master being rank zero, we
        // spawn (size - 1) new functions starting with rank 1.
        for rank in 1..new_size {
            let mut msg = message_factory(&self.core.user, &self.core.function);
            msg.is_mpi = true;
            msg.mpi_world_id = new_id;
            msg.mpi_rank = rank;
            msg.cmdline = call.cmdline.clone();

            scheduler().call_function(msg)?;
        }

        Ok(())
    }

    /// Hydrate a world instance for a non-zero rank from shared state
    pub fn initialise_from_state(&mut self, msg: &Message, world_id: i32) -> Result<()> {
        self.core.id = world_id;
        self.core.user = msg.user.clone();
        self.core.function = msg.function.clone();

        let key = world_state_key(world_id)?;
        let kv = global_kv();
        kv.pull(&key);
        let bytes = kv.get(&key).ok_or(Error::KeyNotFound(key))?;

        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        self.core.size = i32::from_le_bytes(raw);

        self.pool = Some(Arc::new(MpiAsyncPool::new(self.thread_pool_size())));
        Ok(())
    }

    fn push_to_state(&self) -> Result<()> {
        let key = world_state_key(self.core.id)?;
        let kv = global_kv();
        kv.set(&key, &self.core.size.to_le_bytes());
        kv.push_full(&key);
        Ok(())
    }

    fn thread_pool_size(&self) -> usize {
        let usable = usable_cores();
        let world_size = self.core.size as usize;

        if world_size > usable && world_size % usable != 0 {
            warn!("over-provisioning threads in the MPI async pool");
            warn!("to avoid this, set an MPI world size multiple of the cores per machine");
        }
        world_size.min(usable)
    }

    fn pool(&self) -> Result<&Arc<MpiAsyncPool>> {
        self.pool.as_ref().ok_or(Error::WorldNotInitialised)
    }

    /// Tear the world down: delete every KV entry for it and clear the
    /// local queues
    pub fn destroy(&self) -> Result<()> {
        let kv = global_kv();
        kv.delete(&world_state_key(self.core.id)?);

        let mut state = self.core.state.write();
        for rank in state.rank_host_map.keys() {
            kv.delete(&rank_state_key(self.core.id, *rank)?);
        }
        for key in state.windows.keys() {
            kv.delete(key);
        }
        state.rank_host_map.clear();
        state.local_queues.clear();
        state.windows.clear();
        Ok(())
    }

    // ------------------------------------------
    // Identity
    // ------------------------------------------

    pub fn get_id(&self) -> i32 {
        self.core.id
    }

    pub fn get_size(&self) -> i32 {
        self.core.size
    }

    pub fn get_user(&self) -> String {
        self.core.user.clone()
    }

    pub fn get_function(&self) -> String {
        self.core.function.clone()
    }

    /// Seconds since this world instance was constructed
    pub fn get_wtime(&self) -> f64 {
        self.created.elapsed().as_secs_f64()
    }

    // ------------------------------------------
    // Rank registration
    // ------------------------------------------

    pub fn register_rank(&self, rank: i32) -> Result<()> {
        self.core.register_rank(rank)
    }

    pub fn get_host_for_rank(&self, rank: i32) -> Result<String> {
        self.core.get_host_for_rank(rank)
    }

    // ------------------------------------------
    // Point-to-point
    // ------------------------------------------

    pub fn send(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buffer: &[u8],
        datatype: MpiDatatype,
        count: usize,
    ) -> Result<()> {
        self.core
            .send(send_rank, recv_rank, buffer, datatype, count, MpiMessageType::Normal)
    }

    pub fn send_typed(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buffer: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<()> {
        self.core
            .send(send_rank, recv_rank, buffer, datatype, count, message_type)
    }

    pub fn recv(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buffer: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        status: Option<&mut MpiStatus>,
    ) -> Result<()> {
        self.core.recv(
            send_rank,
            recv_rank,
            buffer,
            datatype,
            count,
            status,
            MpiMessageType::Normal,
        )
    }

    /// Post a non-blocking send, returning its request ID
    pub fn isend(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buffer: &[u8],
        datatype: MpiDatatype,
        count: usize,
    ) -> Result<u64> {
        let request_id = generate_gid();
        let core = self.core.clone();
        let owned = buffer.to_vec();

        let future = self.pool()?.submit(
            request_id,
            Box::new(move || {
                core.send(
                    send_rank,
                    recv_rank,
                    &owned,
                    datatype,
                    count,
                    MpiMessageType::Normal,
                )?;
                Ok(None)
            }),
        );

        FUTURES.with(|futures| futures.borrow_mut().insert(request_id, future));
        Ok(request_id)
    }

    /// Post a non-blocking receive. The received bytes come back from
    /// [`MpiWorld::await_async_request`].
    pub fn irecv(
        &self,
        send_rank: i32,
        recv_rank: i32,
        datatype: MpiDatatype,
        count: usize,
    ) -> Result<u64> {
        self.irecv_typed(send_rank, recv_rank, datatype, count, MpiMessageType::Normal)
    }

    fn irecv_typed(
        &self,
        send_rank: i32,
        recv_rank: i32,
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<u64> {
        let request_id = generate_gid();
        let core = self.core.clone();

        let future = self.pool()?.submit(
            request_id,
            Box::new(move || {
                let data = core.recv_owned(send_rank, recv_rank, datatype, count, message_type)?;
                Ok(Some(data))
            }),
        );

        FUTURES.with(|futures| futures.borrow_mut().insert(request_id, future));
        Ok(request_id)
    }

    /// Block until a previously posted request completes. Must run on the
    /// thread that posted it.
    pub fn await_async_request(&self, request_id: u64) -> Result<Option<Vec<u8>>> {
        trace!("MPI - await {}", request_id);

        let future = FUTURES
            .with(|futures| futures.borrow_mut().remove(&request_id))
            .ok_or(Error::UnknownRequest(request_id))?;

        let result = future
            .recv()
            .map_err(|_| Error::Transport("async request worker went away".to_owned()))?;

        debug!("finished await on {}", request_id);
        result
    }

    /// Combined send and receive. Deadlock-free iff the peer performs the
    /// complementary operation.
    #[allow(clippy::too_many_arguments)]
    pub fn send_recv(
        &self,
        send_buffer: &[u8],
        send_count: usize,
        send_type: MpiDatatype,
        dest_rank: i32,
        recv_buffer: &mut [u8],
        recv_count: usize,
        recv_type: MpiDatatype,
        source_rank: i32,
        my_rank: i32,
    ) -> Result<()> {
        trace!(
            "MPI - sendrecv. Rank {}. Sending to: {} - Receiving from: {}",
            my_rank,
            dest_rank,
            source_rank
        );
        self.core.check_rank(dest_rank)?;
        self.core.check_rank(source_rank)?;

        // Post the async recv, send, then await
        let recv_id = self.irecv_typed(
            source_rank,
            my_rank,
            recv_type,
            recv_count,
            MpiMessageType::Sendrecv,
        )?;
        self.core.send(
            my_rank,
            dest_rank,
            send_buffer,
            send_type,
            send_count,
            MpiMessageType::Sendrecv,
        )?;

        if let Some(data) = self.await_async_request(recv_id)? {
            recv_buffer[..data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    // ------------------------------------------
    // Collectives
    // ------------------------------------------

    pub fn broadcast(
        &self,
        send_rank: i32,
        buffer: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<()> {
        self.core.broadcast(send_rank, buffer, datatype, count, message_type)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn scatter(
        &self,
        send_rank: i32,
        recv_rank: i32,
        send_buffer: &[u8],
        send_type: MpiDatatype,
        send_count: usize,
        recv_buffer: &mut [u8],
        recv_type: MpiDatatype,
        recv_count: usize,
    ) -> Result<()> {
        check_send_recv_match(send_type, send_count, recv_type, recv_count)?;

        let send_offset = send_count * send_type.size();

        if recv_rank == send_rank {
            trace!("MPI - scatter {} -> all", send_rank);
            for r in 0..self.core.size {
                let chunk = &send_buffer[r as usize * send_offset..(r as usize + 1) * send_offset];
                if r == send_rank {
                    recv_buffer[..send_offset].copy_from_slice(chunk);
                } else {
                    self.core.send(
                        send_rank,
                        r,
                        chunk,
                        send_type,
                        send_count,
                        MpiMessageType::Scatter,
                    )?;
                }
            }
        } else {
            self.core.recv(
                send_rank,
                recv_rank,
                recv_buffer,
                recv_type,
                recv_count,
                None,
                MpiMessageType::Scatter,
            )?;
        }
        Ok(())
    }

    /// Gather all ranks' chunks onto the root, in rank order.
    ///
    /// `send_buffer = None` means "in place": the root's data is already at
    /// its offset in `recv_buffer`; a non-root sends only its own slice of
    /// `recv_buffer` (the shape all-gather relies on).
    #[allow(clippy::too_many_arguments)]
    pub fn gather(
        &self,
        send_rank: i32,
        recv_rank: i32,
        send_buffer: Option<&[u8]>,
        send_type: MpiDatatype,
        send_count: usize,
        recv_buffer: &mut [u8],
        recv_type: MpiDatatype,
        recv_count: usize,
    ) -> Result<()> {
        check_send_recv_match(send_type, send_count, recv_type, recv_count)?;

        let send_offset = send_count * send_type.size();
        let recv_offset = recv_count * recv_type.size();
        let is_in_place = send_buffer.is_none();

        if send_rank == recv_rank {
            trace!("MPI - gather all -> {}", recv_rank);

            for r in 0..self.core.size {
                let chunk_start = r as usize * recv_offset;

                if r == recv_rank && is_in_place {
                    // Root data is already in position
                    continue;
                } else if r == recv_rank {
                    let send = send_buffer.ok_or(Error::SendRecvMismatch)?;
                    recv_buffer[chunk_start..chunk_start + send_offset]
                        .copy_from_slice(&send[..send_offset]);
                } else {
                    self.core.recv(
                        r,
                        recv_rank,
                        &mut recv_buffer[chunk_start..chunk_start + recv_offset],
                        recv_type,
                        recv_count,
                        None,
                        MpiMessageType::Gather,
                    )?;
                }
            }
        } else if is_in_place {
            // Only this rank's slice of the full buffer gets sent
            let chunk_start = send_rank as usize * send_offset;
            let chunk = recv_buffer[chunk_start..chunk_start + send_offset].to_vec();
            self.core.send(
                send_rank,
                recv_rank,
                &chunk,
                send_type,
                send_count,
                MpiMessageType::Gather,
            )?;
        } else {
            self.core.send(
                send_rank,
                recv_rank,
                send_buffer.unwrap_or_default(),
                send_type,
                send_count,
                MpiMessageType::Gather,
            )?;
        }
        Ok(())
    }

    /// Gather to rank 0, then broadcast the full result
    #[allow(clippy::too_many_arguments)]
    pub fn all_gather(
        &self,
        rank: i32,
        send_buffer: Option<&[u8]>,
        send_type: MpiDatatype,
        send_count: usize,
        recv_buffer: &mut [u8],
        recv_type: MpiDatatype,
        recv_count: usize,
    ) -> Result<()> {
        check_send_recv_match(send_type, send_count, recv_type, recv_count)?;

        let root = 0;
        self.gather(
            rank,
            root,
            send_buffer,
            send_type,
            send_count,
            recv_buffer,
            recv_type,
            recv_count,
        )?;

        // Counts are per-rank, the broadcast covers the full buffer
        let full_count = recv_count * self.core.size as usize;
        if rank == root {
            self.core.broadcast(
                root,
                recv_buffer,
                recv_type,
                full_count,
                MpiMessageType::Allgather,
            )?;
        } else {
            self.core.recv(
                root,
                rank,
                recv_buffer,
                recv_type,
                full_count,
                None,
                MpiMessageType::Allgather,
            )?;
        }
        Ok(())
    }

    /// Reduce all ranks' buffers onto the root with `op`.
    ///
    /// `send_buffer = None` means "in place": the contribution is read from
    /// `recv_buffer`, and on the root the output accumulates over it.
    #[allow(clippy::too_many_arguments)]
    pub fn reduce(
        &self,
        send_rank: i32,
        recv_rank: i32,
        send_buffer: Option<&[u8]>,
        recv_buffer: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        operation: MpiOp,
    ) -> Result<()> {
        let buffer_size = datatype.size() * count;

        if send_rank == recv_rank {
            trace!("MPI - reduce ({:?}) all -> {}", operation, recv_rank);

            // Seed the output with our own values rather than zeroes, which
            // would break min/max
            if let Some(send) = send_buffer {
                recv_buffer[..buffer_size].copy_from_slice(&send[..buffer_size]);
            }

            let mut rank_data = vec![0u8; buffer_size];
            for r in 0..self.core.size {
                if r == recv_rank {
                    continue;
                }
                rank_data.fill(0);
                self.core.recv(
                    r,
                    recv_rank,
                    &mut rank_data,
                    datatype,
                    count,
                    None,
                    MpiMessageType::Reduce,
                )?;
                op_reduce(operation, datatype, count, &rank_data, recv_buffer)?;
            }
        } else {
            match send_buffer {
                Some(send) => self.core.send(
                    send_rank,
                    recv_rank,
                    send,
                    datatype,
                    count,
                    MpiMessageType::Reduce,
                )?,
                None => {
                    let own = recv_buffer[..buffer_size].to_vec();
                    self.core.send(
                        send_rank,
                        recv_rank,
                        &own,
                        datatype,
                        count,
                        MpiMessageType::Reduce,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Reduce to rank 0, then broadcast the result
    pub fn all_reduce(
        &self,
        rank: i32,
        send_buffer: Option<&[u8]>,
        recv_buffer: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        operation: MpiOp,
    ) -> Result<()> {
        if rank == 0 {
            self.reduce(0, 0, send_buffer, recv_buffer, datatype, count, operation)?;
            self.core.broadcast(
                0,
                recv_buffer,
                datatype,
                count,
                MpiMessageType::Allreduce,
            )?;
        } else {
            self.reduce(rank, 0, send_buffer, recv_buffer, datatype, count, operation)?;
            self.core.recv(
                0,
                rank,
                recv_buffer,
                datatype,
                count,
                None,
                MpiMessageType::Allreduce,
            )?;
        }
        Ok(())
    }

    /// Inclusive prefix reduction: rank k ends up with the fold over ranks
    /// 0..=k
    pub fn scan(
        &self,
        rank: i32,
        send_buffer: Option<&[u8]>,
        recv_buffer: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        operation: MpiOp,
    ) -> Result<()> {
        trace!("MPI - scan");
        self.core.check_rank(rank)?;

        let buffer_size = datatype.size() * count;
        if let Some(send) = send_buffer {
            recv_buffer[..buffer_size].copy_from_slice(&send[..buffer_size]);
        }

        if rank > 0 {
            // Receive the running accumulator and fold our own values in
            let mut accumulator = vec![0u8; buffer_size];
            self.core.recv(
                rank - 1,
                rank,
                &mut accumulator,
                datatype,
                count,
                None,
                MpiMessageType::Scan,
            )?;
            op_reduce(operation, datatype, count, &accumulator, recv_buffer)?;
        }

        if rank < self.core.size - 1 {
            self.core.send(
                rank,
                rank + 1,
                recv_buffer,
                datatype,
                count,
                MpiMessageType::Scan,
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn all_to_all(
        &self,
        rank: i32,
        send_buffer: &[u8],
        send_type: MpiDatatype,
        send_count: usize,
        recv_buffer: &mut [u8],
        recv_type: MpiDatatype,
        recv_count: usize,
    ) -> Result<()> {
        check_send_recv_match(send_type, send_count, recv_type, recv_count)?;

        let send_offset = send_count * send_type.size();

        // Send this rank's slices out
        for r in 0..self.core.size {
            let chunk_start = r as usize * send_offset;
            let chunk = &send_buffer[chunk_start..chunk_start + send_offset];

            if r == rank {
                recv_buffer[chunk_start..chunk_start + send_offset].copy_from_slice(chunk);
            } else {
                self.core.send(
                    rank,
                    r,
                    chunk,
                    send_type,
                    send_count,
                    MpiMessageType::Alltoall,
                )?;
            }
        }

        // Collect everyone else's slice for us
        for r in 0..self.core.size {
            if r == rank {
                continue;
            }
            let chunk_start = r as usize * send_offset;
            self.core.recv(
                r,
                rank,
                &mut recv_buffer[chunk_start..chunk_start + send_offset],
                recv_type,
                recv_count,
                None,
                MpiMessageType::Alltoall,
            )?;
        }
        Ok(())
    }

    /// Rank 0 collects a join from every other rank, then broadcasts the
    /// all-clear
    pub fn barrier(&self, this_rank: i32) -> Result<()> {
        if this_rank == 0 {
            for r in 1..self.core.size {
                let mut status = MpiStatus::default();
                self.core.recv(
                    r,
                    0,
                    &mut [],
                    MpiDatatype::Int,
                    0,
                    Some(&mut status),
                    MpiMessageType::BarrierJoin,
                )?;
                trace!("MPI - recv barrier join {}", status.source);
            }

            self.core
                .broadcast(0, &[], MpiDatatype::Int, 0, MpiMessageType::BarrierDone)?;
        } else {
            trace!("MPI - barrier join {}", this_rank);
            self.core.send(
                this_rank,
                0,
                &[],
                MpiDatatype::Int,
                0,
                MpiMessageType::BarrierJoin,
            )?;

            self.core.recv(
                0,
                this_rank,
                &mut [],
                MpiDatatype::Int,
                0,
                None,
                MpiMessageType::BarrierDone,
            )?;
            trace!("MPI - barrier done {}", this_rank);
        }
        Ok(())
    }

    // ------------------------------------------
    // Queues
    // ------------------------------------------

    /// Route an inbound message from another host into this world
    pub fn enqueue_message(&self, msg: MpiMessage) -> Result<()> {
        if msg.world_id != self.core.id {
            return Err(Error::WorldMismatch {
                expected: self.core.id,
                got: msg.world_id,
            });
        }

        if msg.message_type == MpiMessageType::RmaWrite {
            // RMA notifications are processed synchronously to keep the
            // happens-before edge from the remote put
            self.core.synchronize_rma_write(&msg, true)
        } else {
            trace!("queueing message locally {} -> {}", msg.sender, msg.destination);
            let queue = self.core.get_local_queue(msg.sender, msg.destination)?;
            queue.enqueue(msg);
            Ok(())
        }
    }

    pub fn local_queue_size(&self, send_rank: i32, recv_rank: i32) -> Result<usize> {
        Ok(self.core.get_local_queue(send_rank, recv_rank)?.size())
    }

    /// Fill `status` from the head of the queue without consuming it
    pub fn probe(&self, send_rank: i32, recv_rank: i32, status: &mut MpiStatus) -> Result<()> {
        let queue = self.core.get_local_queue(send_rank, recv_rank)?;
        let msg = queue.peek();

        status.bytes_size = msg.count * msg.datatype.size();
        status.error = MPI_SUCCESS;
        status.source = msg.sender;
        Ok(())
    }

    // ------------------------------------------
    // Cartesian topology
    // ------------------------------------------

    /// Compute the 2-D grid coordinates of `rank`, storing the grid shape
    /// for later shifts. Dimensions beyond the second must be 1; the grid
    /// is always periodic.
    pub fn get_cartesian_rank(
        &self,
        rank: i32,
        max_dims: usize,
        dims: &[i32],
        periods: &mut [i32],
        coords: &mut [i32],
    ) -> Result<()> {
        self.core.check_rank(rank)?;

        if dims[0] * dims[1] != self.core.size {
            return Err(Error::BadTopology(format!(
                "product of ranks across dimensions not equal to world size, {} x {} != {}",
                dims[0], dims[1], self.core.size
            )));
        }

        // All ranks store the same grid shape
        {
            let mut cart = self.core.cart_procs_per_dim.lock();
            cart[0] = dims[0];
            cart[1] = dims[1];
        }

        // dims[0] x dims[1] slots in row-major order
        coords[0] = rank / dims[1];
        coords[1] = rank % dims[1];
        periods[0] = 1;
        periods[1] = 1;

        for i in 2..max_dims {
            if dims[i] != 1 {
                return Err(Error::BadTopology(format!(
                    "non-zero number of processes in dimension greater than 2: {} -> {}",
                    i, dims[i]
                )));
            }
            coords[i] = 0;
            periods[i] = 1;
        }
        Ok(())
    }

    /// Inverse of [`MpiWorld::get_cartesian_rank`]
    pub fn get_rank_from_coords(&self, coords: &[i32]) -> Result<i32> {
        let cart = *self.core.cart_procs_per_dim.lock();
        if cart[0] * cart[1] != self.core.size {
            return Err(Error::BadTopology(format!(
                "processors per dimension don't match world size: {} x {} != {}",
                cart[0], cart[1], self.core.size
            )));
        }
        Ok(coords[1] + coords[0] * cart[1])
    }

    /// Torus-wrapped neighbours of `rank` along `direction` for a
    /// displacement of `disp`: returns `(source, destination)` where source
    /// reaches us and destination is whom we reach. Directions beyond the
    /// grid collapse onto the rank itself.
    pub fn shift_cartesian_coords(
        &self,
        rank: i32,
        direction: usize,
        disp: i32,
    ) -> Result<(i32, i32)> {
        let cart = *self.core.cart_procs_per_dim.lock();
        let coords = [rank / cart[1], rank % cart[1]];

        // rem_euclid keeps negative displacements on the torus
        let forward = match direction {
            0 => [(coords[0] + disp).rem_euclid(cart[0]), coords[1]],
            1 => [coords[0], (coords[1] + disp).rem_euclid(cart[1])],
            _ => coords,
        };
        let destination = self.get_rank_from_coords(&forward)?;

        let backward = match direction {
            0 => [(coords[0] - disp).rem_euclid(cart[0]), coords[1]],
            1 => [coords[0], (coords[1] - disp).rem_euclid(cart[1])],
            _ => coords,
        };
        let source = self.get_rank_from_coords(&backward)?;

        Ok((source, destination))
    }

    // ------------------------------------------
    // One-sided RMA
    // ------------------------------------------

    /// Register `window` as this rank's RMA window and publish its initial
    /// contents.
    ///
    /// # Safety
    ///
    /// The caller keeps `window` alive and unmoved until the world is
    /// destroyed; inbound RMA writes copy into it from other threads.
    pub unsafe fn create_window(&self, win_rank: i32, window: &mut [u8]) -> Result<()> {
        let key = window_state_key(self.core.id, win_rank, window.len());

        let kv = global_kv();
        kv.set(&key, window);
        kv.push_full(&key);

        let mut state = self.core.state.write();
        state.windows.insert(
            key,
            WindowPtr {
                ptr: window.as_mut_ptr(),
                len: window.len(),
            },
        );
        Ok(())
    }

    /// One-sided read of another rank's window
    #[allow(clippy::too_many_arguments)]
    pub fn rma_get(
        &self,
        send_rank: i32,
        send_type: MpiDatatype,
        send_count: usize,
        recv_buffer: &mut [u8],
        recv_type: MpiDatatype,
        recv_count: usize,
    ) -> Result<()> {
        check_send_recv_match(send_type, send_count, recv_type, recv_count)?;

        let buf_len = send_type.size() * send_count;
        let key = window_state_key(self.core.id, send_rank, buf_len);

        let kv = global_kv();
        if self.core.get_host_for_rank(send_rank)? != self.core.this_host {
            kv.pull(&key);
        }

        let data = kv.get(&key).ok_or(Error::KeyNotFound(key))?;
        recv_buffer[..data.len()].copy_from_slice(&data);
        Ok(())
    }

    /// One-sided write into another rank's window, then notify it
    #[allow(clippy::too_many_arguments)]
    pub fn rma_put(
        &self,
        send_rank: i32,
        send_buffer: &[u8],
        send_type: MpiDatatype,
        send_count: usize,
        recv_rank: i32,
        recv_type: MpiDatatype,
        recv_count: usize,
    ) -> Result<()> {
        check_send_recv_match(send_type, send_count, recv_type, recv_count)?;

        let buf_len = send_type.size() * send_count;
        let key = window_state_key(self.core.id, recv_rank, buf_len);

        let kv = global_kv();
        kv.set(&key, send_buffer);
        if self.core.get_host_for_rank(recv_rank)? != self.core.this_host {
            kv.push_full(&key);
        }

        // The notification carries the count so the receiver can size the
        // change
        self.core.send(
            send_rank,
            recv_rank,
            &[],
            send_type,
            send_count,
            MpiMessageType::RmaWrite,
        )
    }
}

impl Default for MpiWorld {
    fn default() -> Self {
        MpiWorld::new()
    }
}

impl WorldCore {
    fn check_rank(&self, rank: i32) -> Result<()> {
        if rank > self.size - 1 {
            return Err(Error::RankOutOfRange {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }

    fn register_rank(&self, rank: i32) -> Result<()> {
        {
            let mut state = self.state.write();
            state.rank_host_map.insert(rank, self.this_host.clone());
        }

        // The host name may be shorter than the buffer, pad with nulls
        let width = config().mpi_host_state_len;
        let mut buffer = vec![0u8; width];
        let host_bytes = self.this_host.as_bytes();
        let len = host_bytes.len().min(width);
        buffer[..len].copy_from_slice(&host_bytes[..len]);

        let key = rank_state_key(self.id, rank)?;
        let kv = global_kv();
        kv.set(&key, &buffer);
        kv.push_full(&key);
        Ok(())
    }

    fn get_host_for_rank(&self, rank: i32) -> Result<String> {
        {
            let state = self.state.read();
            if let Some(host) = state.rank_host_map.get(&rank) {
                return Ok(host.clone());
            }
        }

        let mut state = self.state.write();
        if let Some(host) = state.rank_host_map.get(&rank) {
            return Ok(host.clone());
        }

        let key = rank_state_key(self.id, rank)?;
        let kv = global_kv();
        kv.pull(&key);
        let buffer = kv.get(&key).unwrap_or_default();

        // A leading null means nobody has registered this rank yet
        if buffer.first().copied().unwrap_or(0) == 0 {
            return Err(Error::UnknownRank(rank));
        }

        let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
        let host = String::from_utf8_lossy(&buffer[..end]).into_owned();
        state.rank_host_map.insert(rank, host.clone());
        Ok(host)
    }

    fn check_rank_on_this_host(&self, rank: i32) -> Result<()> {
        let state = self.state.read();
        match state.rank_host_map.get(&rank) {
            None => Err(Error::RankNotLocal(rank)),
            Some(host) if *host != self.this_host => Err(Error::RankNotLocal(rank)),
            Some(_) => Ok(()),
        }
    }

    fn get_local_queue(
        &self,
        send_rank: i32,
        recv_rank: i32,
    ) -> Result<Arc<TimedQueue<MpiMessage>>> {
        self.check_rank_on_this_host(recv_rank)?;

        let key = (send_rank, recv_rank);
        {
            let state = self.state.read();
            if let Some(queue) = state.local_queues.get(&key) {
                return Ok(queue.clone());
            }
        }

        let mut state = self.state.write();
        Ok(state
            .local_queues
            .entry(key)
            .or_insert_with(|| Arc::new(TimedQueue::new()))
            .clone())
    }

    pub(crate) fn send(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buffer: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<()> {
        self.check_rank(recv_rank)?;

        let mut msg = MpiMessage {
            id: generate_gid(),
            world_id: self.id,
            sender: send_rank,
            destination: recv_rank,
            datatype,
            count,
            message_type,
            buffer: Vec::new(),
        };
        if count > 0 && !buffer.is_empty() {
            msg.buffer = buffer[..count * datatype.size()].to_vec();
        }

        let other_host = self.get_host_for_rank(recv_rank)?;
        let is_local = other_host == self.this_host;

        if is_local {
            if message_type == MpiMessageType::RmaWrite {
                trace!("MPI - local RMA write {} -> {}", send_rank, recv_rank);
                self.synchronize_rma_write(&msg, false)?;
            } else {
                trace!("MPI - send {} -> {}", send_rank, recv_rank);
                self.get_local_queue(send_rank, recv_rank)?.enqueue(msg);
            }
        } else {
            trace!("MPI - send remote {} -> {}", send_rank, recv_rank);
            FunctionCallClient::new(&other_host).send_mpi_message(&msg)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn recv(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buffer: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        status: Option<&mut MpiStatus>,
        message_type: MpiMessageType,
    ) -> Result<()> {
        trace!("MPI - recv {} -> {}", send_rank, recv_rank);
        let msg = self.dequeue_checked(send_rank, recv_rank, count, message_type)?;

        if msg.count > 0 {
            buffer[..msg.buffer.len()].copy_from_slice(&msg.buffer);
        }

        if let Some(status) = status {
            status.source = msg.sender;
            status.error = MPI_SUCCESS;
            // The message size, as the receive count may be larger
            status.bytes_size = msg.count * datatype.size();
            // TODO thread the real tag through
            status.tag = -1;
        }
        Ok(())
    }

    pub(crate) fn recv_owned(
        &self,
        send_rank: i32,
        recv_rank: i32,
        _datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<Vec<u8>> {
        trace!("MPI - recv {} -> {}", send_rank, recv_rank);
        let msg = self.dequeue_checked(send_rank, recv_rank, count, message_type)?;
        Ok(msg.buffer)
    }

    fn dequeue_checked(
        &self,
        send_rank: i32,
        recv_rank: i32,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<MpiMessage> {
        let msg = self.get_local_queue(send_rank, recv_rank)?.dequeue(None)?;

        if message_type != msg.message_type {
            return Err(Error::TypeMismatch {
                expected: message_type,
                got: msg.message_type,
            });
        }

        if msg.count > count {
            return Err(Error::Truncation {
                got: msg.count,
                want: count,
            });
        }
        Ok(msg)
    }

    pub(crate) fn broadcast(
        &self,
        send_rank: i32,
        buffer: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<()> {
        trace!("MPI - bcast {} -> all", send_rank);
        for r in 0..self.size {
            // The broadcasting rank keeps its own copy
            if r == send_rank {
                continue;
            }
            self.send(send_rank, r, buffer, datatype, count, message_type)?;
        }
        Ok(())
    }

    pub(crate) fn synchronize_rma_write(&self, msg: &MpiMessage, is_remote: bool) -> Result<()> {
        let win_size = msg.count * msg.datatype.size();
        let key = window_state_key(self.id, msg.destination, win_size);

        let kv = global_kv();
        if is_remote {
            kv.pull(&key);
        }
        let data = kv.get(&key).ok_or_else(|| Error::KeyNotFound(key.clone()))?;

        let state = self.state.read();
        let window = state
            .windows
            .get(&key)
            .ok_or(Error::UnregisteredWindow(key))?;

        let len = data.len().min(window.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), window.ptr, len);
        }
        Ok(())
    }
}
