#![no_main]

use libfuzzer_sys::fuzz_target;
use soupstore_core::config::CryptoConfig;
use soupstore_core::{AesGcmCipher, Cipher, EncryptionKey};

fuzz_target!(|data: &[u8]| {
    // Tampered or truncated blob files must be rejected, never panic
    let Ok(cipher) = AesGcmCipher::new(&CryptoConfig::for_tests()) else {
        return;
    };
    let _ = cipher.decrypt(data, &EncryptionKey::new("fuzz_key"));
});
