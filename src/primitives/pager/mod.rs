#![forbid(unsafe_code)]

mod config;
mod image;
mod page;
mod pager;

pub use config::PagerConfig;
pub use image::{
    decode_header, decode_image, ImageHeader, ImageWriter, IMAGE_FORMAT_VERSION, IMAGE_HDR_LEN,
    IMAGE_MAGIC,
};
pub use page::{ColumnBuffer, ColumnPage, PageState};
pub use pager::{ColumnGuard, ColumnPager, PageSummary, PagerOptions, PagerStats};
