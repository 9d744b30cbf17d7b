pub mod json;
pub mod nom_parsers;
