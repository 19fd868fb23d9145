pub mod helpers;
mod tests_config;
