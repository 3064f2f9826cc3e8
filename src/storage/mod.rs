pub mod file_lock;
pub mod layout;
pub mod pidfile;
pub mod conc_file;
