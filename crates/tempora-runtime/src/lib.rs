//! # Tempora Runtime
//!
//! Incremental temporal query runtime built on the event model of
//! `tempora-core`.
//!
//! ## Modules
//!
//! - [`engine`]: query containers, running processes, input/output handles
//! - [`stream`]: the typed query-construction API
//! - [`ingress`]: disorder, punctuation and completion policies per input
//! - [`operator`]: the push operator contract and stateless operators
//! - [`lifetime`], [`window`]: lifetime rewrites and window shapes
//! - [`aggregation`], [`incremental`]: the aggregate contract, built-in
//!   aggregates and the operators that maintain them
//! - [`partition`]: per-key sub-queries
//! - [`join`]: temporal equi-join, union and multicast nodes
//! - [`afa`], [`pattern`]: automaton-based pattern detection
//! - [`persistence`], [`codec`]: checkpoints and their stores
//! - [`config`]: engine configuration and logging setup
//!
//! ## Example
//!
//! ```rust
//! use tempora_runtime::aggregation::Count;
//! use tempora_runtime::engine::QueryContainer;
//! use tempora_runtime::ingress::{DisorderPolicy, PunctuationPolicy};
//! use tempora_core::StreamEvent;
//!
//! let mut container = QueryContainer::new();
//! let (input, stream) = container
//!     .register_input::<(u32, i64)>("sensors", DisorderPolicy::adjust(), PunctuationPolicy::None)
//!     .unwrap();
//! let per_sensor = stream.partition_by(|r: &(u32, i64)| r.0, 0).aggregate(Count::new());
//! let output = container.register_output(per_sensor).unwrap();
//!
//! let mut process = container.start();
//! process.push(&input, StreamEvent::point(1, (7, 20))).unwrap();
//! process.push(&input, StreamEvent::point(2, (7, 21))).unwrap();
//! process.complete(&input).unwrap();
//! assert!(!process.drain(&output).unwrap().is_empty());
//! ```

pub mod afa;
pub mod aggregation;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod incremental;
pub mod ingress;
pub mod join;
pub mod lifetime;
pub mod operator;
pub mod partition;
pub mod pattern;
pub mod persistence;
pub mod stream;
pub mod watermark;
pub mod window;

/// Insertion-ordered map with the Fx hasher, used for per-key tables.
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, rustc_hash::FxBuildHasher>;

pub use afa::{Afa, AfaMatcher, CompiledAfa, PatternMatch, PruningPolicy};
pub use aggregation::Aggregate;
pub use config::{init_logging, EngineConfig};
pub use engine::{coalesce_edges, InputHandle, OutputHandle, QueryContainer, QueryProcess};
pub use error::{EngineError, QueryError};
pub use ingress::{DisorderPolicy, IngressPolicy, OnCompletedPolicy, PunctuationPolicy};
pub use join::{EquiJoin, Merge, Union};
pub use pattern::Regex;
pub use persistence::{CheckpointError, CheckpointStore, FileStore, MemoryStore};
pub use stream::{PartitionedStreamable, Streamable, WindowedStreamable};
pub use window::WindowShape;
