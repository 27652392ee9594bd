use super::*;

mod retry_failed;
