pub mod scan_id;

pub use scan_id::generate_scan_id;
