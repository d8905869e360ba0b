pub mod discovery;

pub use discovery::{find_images, relative_path, DEFAULT_IMAGE_EXTENSIONS};
