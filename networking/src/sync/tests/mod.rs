
mod downloader_tests;
mod node_tests;
mod states_tests;
mod store_tests;
