pub(crate) mod traits;
