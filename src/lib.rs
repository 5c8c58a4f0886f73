pub mod artifact;
pub mod build;
pub mod command;
pub mod db;
mod densemap;
pub mod env;
pub mod fingerprint;
pub mod flags;
pub mod ir;
pub mod observer;
mod perf;
pub mod plan;
mod post_build;
pub mod process;
pub mod resolve;
pub mod run;
mod smallmap;
pub mod version;

pub use smallmap::SmallMap;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
