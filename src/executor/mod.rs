pub mod binding;
pub mod collection;
