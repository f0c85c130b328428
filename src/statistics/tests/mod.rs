mod tests_statistics;
