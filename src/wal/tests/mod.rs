mod helpers;
mod tests_corruption;
