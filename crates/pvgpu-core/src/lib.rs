pub mod config;
pub mod error;
pub mod session;
pub mod message;
pub mod codec;
pub mod rle;
pub mod objects;
pub mod handle_table;
pub mod memory;
pub mod ops;

pub use config::PvgpuConfig;
pub use error::{CoreError, CoreResult};
pub use handle_table::{DashMapHandleTable, HandleTable, HandleTableError};
pub use memory::{IoSpaceMapper, MapError, PagePinner, PinError, PinnedPages};
pub use message::{Message, MessageWithResult, Route};
pub use objects::{Allocation, HandleKind, HandleObject, HwQueue, Resource};
pub use session::{Adapter, Dispatch, IoSpaceRegion, Process, Session};
