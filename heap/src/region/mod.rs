//! Region catalog, region lists and the account-based region manager.

mod list;
mod manager;
mod table;

pub use list::{ListUse, RegionLinks, RegionList, RegionListIter};
pub use manager::{HeapAccount, RegionManager};
pub use table::{
    NO_CHUNK, NO_OWNER, NO_REGION, RegionDescriptor, RegionFlags, RegionId, RegionState,
    RegionTable,
};
