pub mod chat;
pub mod vote;

#[cfg(test)]
pub mod test_support;
