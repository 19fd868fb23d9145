mod tests_compress;
