mod image_request;
mod region_request;

pub use image_request::{
    ImageRequest, ModelInvokeMode, SinkSpec, TileCompression, TileFormat,
};
pub use region_request::RegionRequest;
