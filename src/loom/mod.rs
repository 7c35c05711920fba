//! The `loom` module provides the foundations of asynchronous tensor op execution.
//!
//! ## Key Components
//! 1. **Scheduling**:
//!    - Dependency variables (`Var`) order the reads and writes of work items.
//!    - Two engines (`ThreadedEngine`, `NaiveEngine`) behind one `Engine` trait.
//!    - Ordered command streams for streaming contexts.
//!
//! 2. **Resources**:
//!    - Per-context pools of temp spaces and random streams, leased as written variables.
//!
//! 3. **Operators**:
//!    - Typed parameters parsed from string dictionaries.
//!    - Operator definitions with optional capabilities, collected in a `Registry`.
//!
//! 4. **Invocation**:
//!    - The `Runtime` validates a call, infers shapes and types, allocates outputs and pushes
//!      the kernel to the engine.
//!
//! Contract violations are reported before submission. Kernel failures inside the engine are
//! fatal.

pub mod context;
pub mod engine;
pub mod num;
pub mod ops;
pub mod params;
pub mod platform;
pub mod resource;
pub mod runtime;
pub mod shape;
pub mod tensor;
