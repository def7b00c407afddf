pub mod error;
pub mod locator;
pub mod mlql;
pub mod mutator;
pub mod registry;
pub mod service;
pub mod storage;
pub mod value;

pub use error::{EavError, Result};
pub use locator::{Operator, Search, SearchValue};
pub use registry::{Attribute, AttributeRegistry, EntityTypeDef, TypeRef};
pub use service::{CodePayload, EntityService, NodeService, RouterService};
pub use storage::EavDb;
pub use value::{Action, AttrValue, ChangeKind, Comment, Entity, StorageType, Update, Value};
