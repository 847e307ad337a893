//! EROFS images: the on-disk format, the manifest-driven builder, the
//! per-slab synthetic image and a read-side view.

pub mod builder;
pub mod format;
pub mod slab_image;
pub mod view;

pub use builder::{ChunkAllocator, ImageBuilder};
pub use slab_image::SlabImage;
pub use view::ImageView;
