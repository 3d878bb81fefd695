//! G.711 µ-law Codec
//!
//! Audio wird mit 48 kHz aufgenommen und für den PCMU-Track auf 8 kHz
//! dezimiert. PCMU ist in jedem WebRTC-Stack verfügbar und braucht keine
//! nativen Bibliotheken.

/// Dezimierungsfaktor 48 kHz -> 8 kHz
pub const DECIMATION: usize = 6;

/// µ-law Kodierung von 0.0 (Stille)
pub const ULAW_SILENCE: u8 = 0xFF;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Kodiert ein 16-bit PCM Sample nach µ-law
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Dekodiert ein µ-law Byte zu 16-bit PCM
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let value = !byte as i32;
    let sign = value & 0x80;
    let exponent = (value >> 4) & 0x07;
    let mantissa = value & 0x0F;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// 48 kHz f32 Frame -> 8 kHz µ-law Payload
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .chunks(DECIMATION)
        .map(|chunk| {
            // Mittelwert als einfacher Tiefpass
            let avg = chunk.iter().sum::<f32>() / chunk.len() as f32;
            linear_to_ulaw((avg.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        })
        .collect()
}

/// 8 kHz µ-law Payload -> 48 kHz f32 Samples
pub fn decode_frame(payload: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(payload.len() * DECIMATION);
    for &byte in payload {
        let sample = ulaw_to_linear(byte) as f32 / i16::MAX as f32;
        out.extend(std::iter::repeat(sample).take(DECIMATION));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_encodes_to_ff() {
        assert_eq!(linear_to_ulaw(0), ULAW_SILENCE);
        assert_eq!(ulaw_to_linear(ULAW_SILENCE), 0);
    }

    #[test]
    fn test_sign_is_preserved() {
        assert!(ulaw_to_linear(linear_to_ulaw(12000)) > 0);
        assert!(ulaw_to_linear(linear_to_ulaw(-12000)) < 0);
    }

    #[test]
    fn test_quantization_error_is_bounded() {
        for &sample in &[100i16, 1000, 8000, 20000, 32000, -500, -16000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            // µ-law Schrittweite wächst mit der Amplitude, max. ~3%
            assert!(
                error <= (sample as i32).abs() / 16 + 8,
                "sample {} decoded to {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_frame_sizes() {
        // 20ms @ 48kHz -> 160 Bytes @ 8kHz
        let frame = vec![0.0f32; 960];
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), 160);
        assert!(encoded.iter().all(|b| *b == ULAW_SILENCE));
        assert_eq!(decode_frame(&encoded).len(), 960);
    }
}
