//! Row structs and DTOs.
//!
//! Each submodule holds a `FromRow` + `Serialize` entity matching the
//! database row and, where the core writes the table, a create DTO.

pub mod job;
pub mod project;
pub mod project_file;
pub mod queue;
