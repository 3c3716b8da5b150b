// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! CENC encryption: [`aes`] provides the raw AES-CTR/AES-CBC primitives,
//! [`sample_encryptor`] builds on them to turn a converted sample plus a
//! clear-leader plan into ciphertext and a `DecryptConfig`.

pub mod aes;
pub mod sample_encryptor;

pub use self::aes::{CbcPadding, Cryptor};
pub use self::sample_encryptor::SampleEncryptor;
