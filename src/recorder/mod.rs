mod record;

pub use record::record;
pub use record::Config as RecordConfig;
