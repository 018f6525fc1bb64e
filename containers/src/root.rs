use crate::{Bytes32, Header};
use sha2::{Digest, Sha256};

/// Binary sha256 tree over the hashes of `headers`, padded with zero leaves
/// to the next power of two. This is the root a checkpoint attests to.
pub fn headers_root(headers: &[Header]) -> Bytes32 {
    if headers.is_empty() {
        return Bytes32::ZERO;
    }

    let mut layer: Vec<Bytes32> = headers.iter().map(Header::hash).collect();
    layer.resize(layer.len().next_power_of_two(), Bytes32::ZERO);

    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                let digest: [u8; 32] = hasher.finalize().into();
                Bytes32::from(digest)
            })
            .collect();
    }

    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::BlockFactory;

    #[test]
    fn test_single_header_root_is_padded_hash() {
        let factory = BlockFactory::new(3, 2);
        let genesis = factory.genesis();
        assert_eq!(headers_root(&[genesis.header.clone()]), genesis.hash());
    }

    #[test]
    fn test_root_depends_on_every_header() {
        let factory = BlockFactory::new(3, 2);
        let genesis = factory.genesis();
        let a: Vec<Header> = factory.extend(&genesis.header, 5, 0).into_iter().map(|b| b.header).collect();
        let b: Vec<Header> = factory.extend(&genesis.header, 5, 1).into_iter().map(|b| b.header).collect();

        assert_ne!(headers_root(&a), headers_root(&b));
        assert_ne!(headers_root(&a), headers_root(&a[..4]));
        assert_eq!(headers_root(&a), headers_root(&a.clone()));
    }
}
