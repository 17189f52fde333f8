// All files containing tests
mod common;

mod context;
