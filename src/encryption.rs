//! The raw-packet pipeline: up to two encryption passes followed by a trailing
//!  CRC of 0-4 bytes, all parameterized by the per-connection negotiated
//!  configuration. The CRC is computed over the post-encryption payload with the
//!  connection's encrypt code folded in as a seed, so two connections with the
//!  same payload produce different trailers.
//!
//! Negotiation control packets (Connect, Confirm, Terminate, ...) bypass this
//!  pipeline entirely - they must be parseable before any configuration exists.

use std::sync::Arc;

use crc::Crc;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::config::EncryptMethod;

const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// An application-supplied transform for the `UserSupplied` / `UserSupplied2`
///  encrypt methods. Works in place on the packet body.
pub trait UserTransform: Send + Sync + 'static {
    fn encrypt(&self, data: &mut Vec<u8>);

    /// Returns false if the data cannot be the output of `encrypt`; the packet
    ///  is then rejected like a CRC mismatch.
    fn decrypt(&self, data: &mut Vec<u8>) -> bool;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecodeError {
    /// Packet shorter than its own CRC trailer. Fatal to the connection.
    TooShort,
    /// Trailer mismatch. Recoverable - counted and dropped.
    CrcMismatch,
    /// A user transform refused the data. Recoverable like a CRC mismatch.
    TransformFailed,
}

pub struct RawPipeline {
    methods: [EncryptMethod; 2],
    user_transforms: [Option<Arc<dyn UserTransform>>; 2],
    encrypt_code: u32,
    crc_bytes: usize,
    key_buffer: Vec<u8>,
}

impl RawPipeline {
    pub fn new(
        methods: [EncryptMethod; 2],
        user_transforms: [Option<Arc<dyn UserTransform>>; 2],
        encrypt_code: u32,
        crc_bytes: u8,
        max_raw_packet_size: usize,
    ) -> RawPipeline {
        let needs_key_buffer = methods.contains(&EncryptMethod::XorBuffer);
        let key_buffer = if needs_key_buffer {
            let mut buf = vec![0u8; max_raw_packet_size];
            StdRng::seed_from_u64(encrypt_code as u64).fill_bytes(&mut buf);
            buf
        } else {
            Vec::new()
        };

        RawPipeline {
            methods,
            user_transforms,
            encrypt_code,
            crc_bytes: crc_bytes as usize,
            key_buffer,
        }
    }

    /// Extra bytes the pipeline appends to every cooked packet.
    pub fn overhead(&self) -> usize {
        self.crc_bytes
    }

    /// Cooked packet in, wire datagram out: both passes in order, then the CRC
    ///  trailer.
    pub fn encode(&self, cooked: &[u8]) -> Vec<u8> {
        let mut data = cooked.to_vec();
        for pass in 0..2 {
            self.encrypt_pass(pass, &mut data);
        }
        if self.crc_bytes > 0 {
            let trailer = self.crc_of(&data);
            data.extend_from_slice(&trailer[..self.crc_bytes]);
        }
        data
    }

    /// Wire datagram in, cooked packet out: CRC verify and strip, then both
    ///  passes in reverse order.
    pub fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if raw.len() < self.crc_bytes {
            return Err(DecodeError::TooShort);
        }
        let (body, trailer) = raw.split_at(raw.len() - self.crc_bytes);
        if self.crc_bytes > 0 {
            let expected = self.crc_of(body);
            if trailer != &expected[..self.crc_bytes] {
                return Err(DecodeError::CrcMismatch);
            }
        }

        let mut data = body.to_vec();
        for pass in (0..2).rev() {
            if !self.decrypt_pass(pass, &mut data) {
                return Err(DecodeError::TransformFailed);
            }
        }
        Ok(data)
    }

    fn crc_of(&self, data: &[u8]) -> [u8; 4] {
        let mut digest = CRC.digest();
        digest.update(&self.encrypt_code.to_be_bytes());
        digest.update(data);
        digest.finalize().to_be_bytes()
    }

    fn encrypt_pass(&self, pass: usize, data: &mut Vec<u8>) {
        match self.methods[pass] {
            EncryptMethod::None => {}
            EncryptMethod::Xor => self.xor_encrypt(data),
            EncryptMethod::XorBuffer => self.xor_buffer(data),
            EncryptMethod::UserSupplied | EncryptMethod::UserSupplied2 => {
                if let Some(transform) = &self.user_transforms[pass] {
                    transform.encrypt(data);
                }
            }
        }
    }

    fn decrypt_pass(&self, pass: usize, data: &mut Vec<u8>) -> bool {
        match self.methods[pass] {
            EncryptMethod::None => true,
            EncryptMethod::Xor => {
                self.xor_decrypt(data);
                true
            }
            EncryptMethod::XorBuffer => {
                self.xor_buffer(data);
                true
            }
            EncryptMethod::UserSupplied | EncryptMethod::UserSupplied2 => {
                match &self.user_transforms[pass] {
                    Some(transform) => transform.decrypt(data),
                    None => false,
                }
            }
        }
    }

    fn key_byte(&self, index: usize) -> u8 {
        self.encrypt_code.to_be_bytes()[index % 4]
    }

    // ciphertext chaining: c[i] = p[i] ^ key[i] ^ c[i-1]
    fn xor_encrypt(&self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (i, b) in data.iter_mut().enumerate() {
            let c = *b ^ self.key_byte(i) ^ prev;
            prev = c;
            *b = c;
        }
    }

    fn xor_decrypt(&self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (i, b) in data.iter_mut().enumerate() {
            let c = *b;
            *b = c ^ self.key_byte(i) ^ prev;
            prev = c;
        }
    }

    // plain XOR against the pre-seeded key buffer - self-inverse
    fn xor_buffer(&self, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= self.key_buffer[i % self.key_buffer.len()];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pipeline(methods: [EncryptMethod; 2], crc_bytes: u8) -> RawPipeline {
        RawPipeline::new(methods, [None, None], 0x1234_5678, crc_bytes, 512)
    }

    #[rstest]
    #[case::plain([EncryptMethod::None, EncryptMethod::None], 0)]
    #[case::xor([EncryptMethod::Xor, EncryptMethod::None], 0)]
    #[case::xor_buffer([EncryptMethod::XorBuffer, EncryptMethod::None], 0)]
    #[case::both_passes([EncryptMethod::Xor, EncryptMethod::XorBuffer], 0)]
    #[case::with_crc([EncryptMethod::Xor, EncryptMethod::None], 2)]
    #[case::full_crc([EncryptMethod::XorBuffer, EncryptMethod::Xor], 4)]
    fn test_encode_decode_identity(#[case] methods: [EncryptMethod; 2], #[case] crc_bytes: u8) {
        let pipeline = pipeline(methods, crc_bytes);
        let cooked: Vec<u8> = (0..200u16).map(|i| (i % 256) as u8).collect();

        let raw = pipeline.encode(&cooked);
        assert_eq!(raw.len(), cooked.len() + crc_bytes as usize);
        assert_eq!(pipeline.decode(&raw).unwrap(), cooked);
    }

    #[test]
    fn test_xor_actually_scrambles() {
        let pipeline = pipeline([EncryptMethod::Xor, EncryptMethod::None], 0);
        let cooked = vec![0u8; 64];
        let raw = pipeline.encode(&cooked);
        assert_ne!(raw, cooked);
    }

    #[test]
    fn test_flipped_bit_is_caught_by_crc() {
        let pipeline = pipeline([EncryptMethod::None, EncryptMethod::None], 2);
        let mut raw = pipeline.encode(&[1, 2, 3, 4, 5]);
        raw[2] ^= 0x10;
        assert_eq!(pipeline.decode(&raw), Err(DecodeError::CrcMismatch));
    }

    #[test]
    fn test_packet_shorter_than_crc_trailer() {
        let pipeline = pipeline([EncryptMethod::None, EncryptMethod::None], 4);
        assert_eq!(pipeline.decode(&[1, 2]), Err(DecodeError::TooShort));
    }

    #[test]
    fn test_different_codes_produce_different_trailers() {
        let a = RawPipeline::new([EncryptMethod::None; 2], [None, None], 1, 4, 512);
        let b = RawPipeline::new([EncryptMethod::None; 2], [None, None], 2, 4, 512);
        let cooked = [7u8; 16];
        assert_ne!(a.encode(&cooked), b.encode(&cooked));
    }

    #[test]
    fn test_user_transform_round_trip_and_rejection() {
        struct AddOne;
        impl UserTransform for AddOne {
            fn encrypt(&self, data: &mut Vec<u8>) {
                for b in data.iter_mut() {
                    *b = b.wrapping_add(1);
                }
                data.push(0xAA); // tag so decrypt can verify
            }
            fn decrypt(&self, data: &mut Vec<u8>) -> bool {
                if data.pop() != Some(0xAA) {
                    return false;
                }
                for b in data.iter_mut() {
                    *b = b.wrapping_sub(1);
                }
                true
            }
        }

        let pipeline = RawPipeline::new(
            [EncryptMethod::UserSupplied, EncryptMethod::None],
            [Some(Arc::new(AddOne)), None],
            9,
            0,
            512,
        );

        let raw = pipeline.encode(&[1, 2, 3]);
        assert_eq!(pipeline.decode(&raw).unwrap(), vec![1, 2, 3]);

        let mut tampered = raw.clone();
        *tampered.last_mut().unwrap() = 0;
        assert_eq!(pipeline.decode(&tampered), Err(DecodeError::TransformFailed));
    }
}
