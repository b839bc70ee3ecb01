use derive_more::{Display, From, Into};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Into,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

row_id!(
    /// Identifier of an operator account.
    UserId
);
row_id!(
    /// Identifier of a registered worker node.
    NodeId
);
row_id!(
    /// Identifier of a node-declared dataset descriptor.
    MetadataId
);
row_id!(
    /// Identifier of an experiment.
    ExperimentId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_from_path_segments() {
        assert_eq!("42".parse::<ExperimentId>().unwrap(), ExperimentId::new(42));
        assert!("forty-two".parse::<NodeId>().is_err());
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&MetadataId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
