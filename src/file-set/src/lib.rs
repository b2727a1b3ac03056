mod file_set_db;

pub use file_set_db::LocalFileSetDB;
