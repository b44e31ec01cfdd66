use tracing::error;

/// All session audio runs at 48 kHz mono.
pub const SAMPLE_RATE: u32 = 48_000;
/// 20 ms of mono audio at 48 kHz.
pub const FRAME_SAMPLES: usize = 960;

/// Opus encoder wrapper for the outgoing voice track.
pub struct OpusEncoder {
    encoder: opus::Encoder,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, String> {
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| format!("failed to create Opus encoder: {}", e))?;
        Ok(Self { encoder })
    }

    /// Encode one 20 ms PCM frame to Opus bytes.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, String> {
        let mut output = vec![0u8; 4000];
        let len = self.encoder.encode_float(pcm, &mut output).map_err(|e| {
            error!("opus encode error: {}", e);
            format!("opus encode error: {}", e)
        })?;
        output.truncate(len);
        Ok(output)
    }
}

/// Opus decoder wrapper for the remote voice track.
pub struct OpusDecoder {
    decoder: opus::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, String> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| format!("failed to create Opus decoder: {}", e))?;
        Ok(Self { decoder })
    }

    /// Decode an Opus packet to a PCM frame.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, String> {
        let mut output = vec![0.0f32; FRAME_SAMPLES];
        let len = self
            .decoder
            .decode_float(data, &mut output, false)
            .map_err(|e| {
                error!("opus decode error: {}", e);
                format!("opus decode error: {}", e)
            })?;
        output.truncate(len);
        Ok(output)
    }
}
