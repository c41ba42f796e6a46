pub mod gap_rewrite;
pub mod opset_downgrade;
