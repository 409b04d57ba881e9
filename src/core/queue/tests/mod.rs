mod pool;
mod retry_policy;
