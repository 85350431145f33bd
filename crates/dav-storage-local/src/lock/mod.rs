mod file;

pub use file::FileLockTable;
