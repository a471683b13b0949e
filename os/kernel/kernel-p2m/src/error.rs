use crate::entry::P2mType;
use kernel_logdirty::LogDirtyError;
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum P2mError {
    #[error("out of memory for translation-tree nodes or backing frames")]
    OutOfMemory,
    #[error("gfn {gfn} is outside the guest frame space")]
    GfnOutOfRange { gfn: Gfn },
    #[error("mapping order {order} is not supported")]
    UnsupportedOrder { order: u32 },
    #[error("gfn {gfn} or mfn {mfn} is not aligned to a {order} mapping")]
    Misaligned { gfn: Gfn, mfn: Mfn, order: PageOrder },
    #[error("{mfn} is not a valid populate-on-demand hint for a {order} entry")]
    InvalidPodHint { mfn: Mfn, order: PageOrder },
    #[error("cannot retype {from:?} entries to {to:?}")]
    MmioRetype { from: P2mType, to: P2mType },
    #[error("no dirty-VRAM window is set")]
    NoVramWindow,
    #[error(transparent)]
    LogDirty(#[from] LogDirtyError),
}
