pub mod generate;
pub mod info;

mod util;
