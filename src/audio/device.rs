use cpal::{
    FromSample, Sample, SampleFormat, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};

use super::{AudioError, Mixer};

pub(super) fn open_output(mixer: Mixer) -> Result<(cpal::Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|err| AudioError::Config(err.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let config = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer)?,
        other => return Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    };

    stream
        .play()
        .map_err(|err| AudioError::Stream(err.to_string()))?;
    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = (config.channels as usize).max(1);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixer.pull_pending();
                for frame in data.chunks_mut(channels) {
                    let [left, right] = mixer.next_frame();
                    for (channel, sample) in frame.iter_mut().enumerate() {
                        let value = if channel % 2 == 0 { left } else { right };
                        *sample = T::from_sample(value);
                    }
                }
            },
            |err| log::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|err| AudioError::Stream(err.to_string()))
}
