use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::message::Message;
use crate::mpi::world::MpiWorld;

lazy_static! {
    static ref WORLDS: RwLock<HashMap<i32, Arc<MpiWorld>>> = RwLock::new(HashMap::new());
}

/// Create a world as rank 0 and register it in this process. An optional
/// host override makes the instance stand in for another cluster member.
pub fn create_world(msg: &Message, world_id: i32, host: Option<&str>) -> Result<Arc<MpiWorld>> {
    debug!("creating world {}", world_id);

    let mut world = MpiWorld::new();
    if let Some(host) = host {
        world.override_host(host);
    }
    world.create(msg, world_id, msg.mpi_world_size)?;

    let world = Arc::new(world);
    WORLDS.write().insert(world_id, world.clone());
    Ok(world)
}

/// The instance for a message's world, hydrating from shared state on first
/// sight
pub fn get_or_init_world(msg: &Message) -> Result<Arc<MpiWorld>> {
    let world_id = msg.mpi_world_id;
    {
        let worlds = WORLDS.read();
        if let Some(world) = worlds.get(&world_id) {
            return Ok(world.clone());
        }
    }

    let mut worlds = WORLDS.write();
    if let Some(world) = worlds.get(&world_id) {
        return Ok(world.clone());
    }

    debug!("initialising world {} from state", world_id);
    let mut world = MpiWorld::new();
    world.initialise_from_state(msg, world_id)?;
    let world = Arc::new(world);
    worlds.insert(world_id, world.clone());
    Ok(world)
}

/// Drop every world registered in this process
pub fn clear_worlds() {
    WORLDS.write().clear();
}
