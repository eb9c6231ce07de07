mod common;

mod build_tests;
mod image_tests;
mod prune_tests;
