mod file;
mod file_in;
mod watch;
