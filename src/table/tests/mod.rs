mod helpers;
mod tests_integrity;
