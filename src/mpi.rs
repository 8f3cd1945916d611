use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

pub(crate) mod async_pool;
pub(crate) mod registry;
pub(crate) mod world;

pub use registry::{clear_worlds, create_world, get_or_init_world};
pub use world::MpiWorld;

pub const MPI_SUCCESS: i32 = 0;

/// Datatypes carried by world messages
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MpiDatatype {
    #[default]
    Int,
    Double,
    LongLong,
    Byte,
}

impl MpiDatatype {
    pub fn size(&self) -> usize {
        match self {
            MpiDatatype::Int => 4,
            MpiDatatype::Double => 8,
            MpiDatatype::LongLong => 8,
            MpiDatatype::Byte => 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiOp {
    Max,
    Min,
    Sum,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MpiMessageType {
    #[default]
    Normal,
    BarrierJoin,
    BarrierDone,
    Scatter,
    Gather,
    Allgather,
    Reduce,
    Allreduce,
    Scan,
    Alltoall,
    Sendrecv,
    RmaWrite,
}

/// Receive status, in the shape drivers expect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MpiStatus {
    pub source: i32,
    pub error: i32,
    pub bytes_size: usize,
    pub tag: i32,
}

/// One message between two ranks of a world.
///
/// The buffer holds `datatype.size() * count` bytes and may be empty
/// (barriers, RMA notifications).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MpiMessage {
    pub id: u64,
    pub world_id: i32,
    pub sender: i32,
    pub destination: i32,
    pub datatype: MpiDatatype,
    pub count: usize,
    pub message_type: MpiMessageType,
    pub buffer: Vec<u8>,
}

impl MpiMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MpiMessage> {
        crate::deserialize(bytes)
    }
}

// ------------------------------------------
// State key grammar
// ------------------------------------------

pub fn world_state_key(world_id: i32) -> Result<String> {
    if world_id <= 0 {
        return Err(Error::InvalidWorldId(world_id));
    }
    Ok(format!("mpi_world_{}", world_id))
}

pub fn rank_state_key(world_id: i32, rank: i32) -> Result<String> {
    if world_id <= 0 || rank < 0 {
        return Err(Error::InvalidWorldId(world_id));
    }
    Ok(format!("mpi_rank_{}_{}", world_id, rank))
}

pub fn window_state_key(world_id: i32, rank: i32, size: usize) -> String {
    format!("mpi_win_{}_{}_{}", world_id, rank, size)
}

// ------------------------------------------
// Reductions
// ------------------------------------------

/// Fail whenever the send and receive datatypes differ. Receiving with a
/// larger count than was sent is legal and handled at recv time.
pub fn check_send_recv_match(
    send_type: MpiDatatype,
    send_count: usize,
    recv_type: MpiDatatype,
    recv_count: usize,
) -> Result<()> {
    if send_type != recv_type {
        error!(
            "must match types (send {:?}:{}, recv {:?}:{})",
            send_type, send_count, recv_type, recv_count
        );
        return Err(Error::SendRecvMismatch);
    }
    Ok(())
}

macro_rules! reduce_slots {
    ($ty:ty, $count:expr, $in_buf:expr, $out_buf:expr, $fold:expr) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        for slot in 0..$count {
            let lo = slot * WIDTH;
            let hi = lo + WIDTH;
            let incoming = <$ty>::from_ne_bytes($in_buf[lo..hi].try_into().unwrap());
            let current = <$ty>::from_ne_bytes($out_buf[lo..hi].try_into().unwrap());
            let folded: $ty = $fold(current, incoming);
            $out_buf[lo..hi].copy_from_slice(&folded.to_ne_bytes());
        }
    }};
}

/// Fold `in_buffer` into `out_buffer` elementwise with `op`
pub fn op_reduce(
    op: MpiOp,
    datatype: MpiDatatype,
    count: usize,
    in_buffer: &[u8],
    out_buffer: &mut [u8],
) -> Result<()> {
    match (op, datatype) {
        (MpiOp::Max, MpiDatatype::Int) => {
            reduce_slots!(i32, count, in_buffer, out_buffer, |a: i32, b: i32| a.max(b))
        }
        (MpiOp::Max, MpiDatatype::Double) => {
            reduce_slots!(f64, count, in_buffer, out_buffer, |a: f64, b: f64| {
                if b > a {
                    b
                } else {
                    a
                }
            })
        }
        (MpiOp::Max, MpiDatatype::LongLong) => {
            reduce_slots!(i64, count, in_buffer, out_buffer, |a: i64, b: i64| a.max(b))
        }
        (MpiOp::Min, MpiDatatype::Int) => {
            reduce_slots!(i32, count, in_buffer, out_buffer, |a: i32, b: i32| a.min(b))
        }
        (MpiOp::Min, MpiDatatype::Double) => {
            reduce_slots!(f64, count, in_buffer, out_buffer, |a: f64, b: f64| {
                if b < a {
                    b
                } else {
                    a
                }
            })
        }
        (MpiOp::Min, MpiDatatype::LongLong) => {
            reduce_slots!(i64, count, in_buffer, out_buffer, |a: i64, b: i64| a.min(b))
        }
        (MpiOp::Sum, MpiDatatype::Int) => {
            reduce_slots!(i32, count, in_buffer, out_buffer, |a: i32, b: i32| a + b)
        }
        (MpiOp::Sum, MpiDatatype::Double) => {
            reduce_slots!(f64, count, in_buffer, out_buffer, |a: f64, b: f64| a + b)
        }
        (MpiOp::Sum, MpiDatatype::LongLong) => {
            reduce_slots!(i64, count, in_buffer, out_buffer, |a: i64, b: i64| a + b)
        }
        (op, datatype) => {
            error!("unsupported reduction (op={:?}, datatype={:?})", op, datatype);
            return Err(Error::UnsupportedReduceOp { op, datatype });
        }
    }
    Ok(())
}

// ------------------------------------------
// Byte-view helpers for driver code and tests
// ------------------------------------------

pub fn ints_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_ints(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn doubles_to_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_doubles(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn long_longs_to_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_long_longs(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}
