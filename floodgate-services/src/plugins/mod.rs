pub mod access_log;
pub mod extra_params;
