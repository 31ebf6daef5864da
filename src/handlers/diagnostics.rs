use crate::models::DiagnosticsResponse;
use crate::services::auth_service::Identity;
use crate::ws::hub::RoomHub;
use axum::{
    extract::{Extension, State},
    Json,
};
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Live counters for the room hub plus process-level system stats.
pub async fn diagnostics(
    State(hub): State<Arc<RoomHub>>,
    Extension(identity): Extension<Identity>,
) -> Json<DiagnosticsResponse> {
    let stats = hub.stats();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics for {}: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}",
        identity.user_id,
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.n_conn,
        stats.n_rooms
    );

    Json(DiagnosticsResponse {
        n_conn: stats.n_conn,
        n_in_room: stats.n_in_room,
        n_rooms: stats.n_rooms,
        n_cursor_rooms: stats.n_cursor_rooms,
        cpu_usage,
        memory_alloc,
        memory_total,
        memory_free,
    })
}
