/// Runtime event payloads.
pub mod events;
/// Runtime handle, command loop and persistence worker.
pub mod handle;
