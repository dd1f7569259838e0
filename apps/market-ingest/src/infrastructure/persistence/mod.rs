//! Bar store adapters.

mod in_memory;
mod timescale;

pub use in_memory::InMemoryBarStore;
pub use timescale::PostgresBarStore;
