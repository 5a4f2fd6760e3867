pub mod address;
pub mod path;

pub use address::{leaf_address, node_address, AddressGrammar, AddressKind, PropertyAddress};
pub use path::{is_within, lexical_normalize, normalize_key, os_path_to_string, FOLDS_CASE};
