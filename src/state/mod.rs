/// State management module
///
/// This module handles all catalog state, including:
/// - Shared data structures (data.rs)
/// - The CRUD collaborator seam (backend.rs) and its SQLite implementation (library.rs)
/// - Change notifications (events.rs)
/// - The synchronized, display-ready catalog (catalog.rs)

pub mod backend;
pub mod catalog;
pub mod data;
pub mod events;
pub mod library;
