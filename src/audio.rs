use std::sync::Arc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::info;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::engine::{LocalMedia, MediaSource};
use crate::error::{Error, Result};

const OPUS_CLOCK_RATE: u32 = 48_000;

/// Capture format of the input device that was granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Default system microphone via cpal.
pub struct CpalMicrophone {
    stream_id: String,
}

impl CpalMicrophone {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }

    fn probe() -> Result<InputDevice> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::MediaAcquisition("No input device available".to_string()))?;
        let name = device
            .name()
            .map_err(|e| Error::MediaAcquisition(format!("cannot read device name: {}", e)))?;
        let config = device
            .default_input_config()
            .map_err(|e| Error::MediaAcquisition(format!("{}: {}", name, e)))?;

        Ok(InputDevice {
            name,
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        })
    }
}

#[async_trait]
impl MediaSource for CpalMicrophone {
    async fn acquire(&self) -> Result<LocalMedia> {
        // Device enumeration blocks on some hosts.
        let device = tokio::task::spawn_blocking(Self::probe)
            .await
            .map_err(|e| Error::MediaAcquisition(format!("device probe aborted: {}", e)))??;
        info!(
            "Input device '{}' ({} Hz, {} channel(s))",
            device.name, device.sample_rate, device.channels
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: device.channels.min(2),
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));

        Ok(LocalMedia {
            label: device.name,
            tracks: vec![track],
        })
    }
}
