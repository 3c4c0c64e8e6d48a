//! Entity Model
//!
//! Fields, records, shared handles and the document codec.
//!
//! # Lifecycle
//!
//! ```text
//! Record (thawed) → initializer / mutation → Record (frozen) → Handle
//!                          ↑                                      │
//!                          └──────── snapshot + thaw ←────────────┘
//! ```

pub mod codec;
pub mod field;
pub mod handle;
pub mod key;
pub mod record;

pub use codec::Document;
pub use field::{Access, Field, FieldAccess, FieldValue};
pub use handle::Handle;
pub use key::EntityKey;
pub use record::{Entity, Record, ID_FIELD, VERSION_FIELD};
