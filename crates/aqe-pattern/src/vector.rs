//! Typed f32 vector operations used by the pattern index and the
//! differential-privacy machinery.

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Euclidean (L2) norm.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Copy of the vector scaled to unit L2 norm. Zero vectors are returned
/// unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Cosine similarity in [-1, 1]. None for mismatched lengths or zero
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    let dot_product = dot(a, b)?;
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot_product / (norm_a * norm_b))
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    )
}

/// Encode a vector as little-endian f32 bytes.
pub fn encode_f32_le(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes; None if the length is not a multiple of
/// four.
pub fn decode_f32_le(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_and_norm() {
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), Some(11.0));
        assert_eq!(dot(&[1.0], &[1.0, 2.0]), None);
        assert_eq!(l2_norm(&[3.0, 4.0]), 5.0);
    }

    #[test]
    fn test_normalize() {
        let n = normalize(&[3.0, 4.0]);
        assert!((l2_norm(&n) - 1.0).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity() {
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);

        let orthogonal = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(orthogonal.abs() < 1e-6);

        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
    }

    #[test]
    fn test_euclidean_distance() {
        let d = euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_f32_le_roundtrip() {
        let v = vec![0.1f32, -2.5, 1000.25];
        let bytes = encode_f32_le(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_f32_le(&bytes).unwrap(), v);
        assert!(decode_f32_le(&bytes[..5]).is_none());
    }
}
