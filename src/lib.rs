//! # recgraph-core
//!
//! An embedded, in-memory record-graph engine: typed, identified records connected by many kinds
//! of relations, each edge carrying its own metadata, persisted as versioned TOML documents.
//!
//! ## Overview
//!
//! Records (people, institutions, works, notes, folders) live in one [`store::RecordStore`] per
//! type. Every relation kind is backed by its own [`relation::RelationSet`], which enforces the
//! relation's multiplicity, cycle rule and nested attributes as declared in the static
//! [`catalog::CATALOG`]. The [`Database`] owns all of them and is the single entry point for
//! creating, editing, deleting, loading and saving records.
//!
//! ### Key Features
//!
//! - **Fixpoint resolution**: references read from documents may point forward, into another
//!   document, or at records that only gain the needed relation in a later pass
//! - **Search keys**: short, case-insensitively unique handles for records
//! - **Mentions index**: who references a record, through text or through relations, rebuilt in
//!   the background and maintained incrementally
//! - **Deletion cascades**: deleting a folder takes its subfolders and notes along, with every
//!   edge detached before anything is purged
//! - **Versioned documents**: old documents are migrated on read, externally edited documents are
//!   detected before they are overwritten
//!
//! ## Architecture
//!
//! - **[`catalog`]**: record types, attribute tags and relation definitions
//! - **[`store`]**, **[`record`]**: per-type arenas of records and their flat serialized state
//! - **[`relation`]**: edge tables with nested attributes and change observers
//! - **[`resolver`]**: the gate and the fixpoint resolution of raw references
//! - **[`search_key`]**: the unique key index
//! - **[`mentions`]**: the background-maintained reverse reference index
//! - **[`codec`]**: TOML documents, migrations, checksums and settings
//! - **[`event`]**: [`event::GraphEvent`] streaming to subscribers
//!
//! ## Quick Start
//!
//! ```rust
//! use recgraph_core::{
//!     catalog::RelationKind,
//!     mentions::Wait,
//!     properties::{EdgeAttrs, RecordType},
//!     record::RecordState,
//!     Database,
//! };
//!
//! let mut db = Database::default();
//! let darwin = db.create(RecordState::new(RecordType::Person).with_search_key("darwin"))?;
//! let origin = db.create(
//!     RecordState::new(RecordType::Work)
//!         .with_attr("title", "On the Origin of Species")?
//!         .with_edge(RelationKind::Authorship, darwin, EdgeAttrs::new()),
//! )?;
//!
//! // A person without a key work adopts the first work they authored
//! assert_eq!(db.relation(RelationKind::KeyWork).object(darwin), Some(origin));
//! assert!(db.mentioner_set(darwin, Wait::Yes).value.contains(&origin));
//! assert_eq!(db.lookup("DARWIN"), Some(darwin));
//! # Ok::<(), recgraph_core::GraphError>(())
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod event;
pub mod host;
pub mod mentions;
pub mod properties;
pub mod record;
pub mod relation;
pub mod resolver;
pub mod richtext;
pub mod search_key;
pub mod store;

pub use database::Database;
pub use error::*;
