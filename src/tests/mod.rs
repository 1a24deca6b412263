mod test_gpt;
