pub mod helpers;

mod tests_compaction;
mod tests_properties;
mod tests_recovery;
mod tests_rotation;
mod tests_shutdown;
mod tests_snapshots;
mod tests_write_read;
