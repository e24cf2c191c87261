//! Hourglass feature extractor shared by the registration network.
//!
//! Stride-2 convolutions narrow the concatenated `[moving, fixed]` pair to a
//! bottleneck; the decoder widens it again with nearest-neighbour upsampling
//! and skip connections from the encoder.

use burn::{
    module::Module,
    nn::{
        conv::{Conv3d, Conv3dConfig},
        PaddingConfig3d,
    },
    tensor::{activation::leaky_relu, backend::Backend, Tensor},
};

/// 3x3x3 convolution followed by a leaky ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
    negative_slope: f64,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, negative_slope: f64, device: &B::Device) -> Self {
        let conv = Conv3dConfig::new([in_channels, out_channels], [3, 3, 3])
            .with_stride([stride, stride, stride])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);

        Self { conv, negative_slope }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        leaky_relu(self.conv.forward(x), self.negative_slope)
    }
}

/// Nearest-neighbour x2 upsampling of every spatial axis.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, c, d, h, w] = x.dims();

    let x = x.reshape([b, c, d, 1, h * w]).repeat_dim(3, 2).reshape([b, c, 2 * d, h, w]);
    let x = x.reshape([b, c * 2 * d, h, 1, w]).repeat_dim(3, 2).reshape([b, c, 2 * d, 2 * h, w]);
    x.reshape([b, c * 2 * d * 2 * h, w, 1])
        .repeat_dim(3, 2)
        .reshape([b, c, 2 * d, 2 * h, 2 * w])
}

/// Encoder-decoder core.
///
/// With `L` encoder stages the decoder uses `dec_features[0..=L]` down to
/// half resolution, `dec_features[L + 1]` for the optional full-resolution
/// stage and `dec_features[L + 2]` for an optional extra convolution.
#[derive(Module, Debug)]
pub struct UnetCore<B: Backend> {
    encoder: Vec<ConvBlock<B>>,
    decoder: Vec<ConvBlock<B>>,
    full_res: Option<ConvBlock<B>>,
    extra: Option<ConvBlock<B>>,
    out_channels: usize,
}

impl<B: Backend> UnetCore<B> {
    /// Build the core. Schedules are expected to be validated by the caller.
    pub fn new(
        in_channels: usize,
        enc_features: &[usize],
        dec_features: &[usize],
        full_size: bool,
        negative_slope: f64,
        device: &B::Device,
    ) -> Self {
        let levels = enc_features.len();

        let mut encoder = Vec::with_capacity(levels);
        let mut prev = in_channels;
        for &nf in enc_features {
            encoder.push(ConvBlock::new(prev, nf, 2, negative_slope, device));
            prev = nf;
        }

        let mut decoder = Vec::with_capacity(levels + 1);
        decoder.push(ConvBlock::new(prev, dec_features[0], 1, negative_slope, device));
        for k in 1..levels {
            let skip = enc_features[levels - 1 - k];
            decoder.push(ConvBlock::new(dec_features[k - 1] + skip, dec_features[k], 1, negative_slope, device));
        }
        decoder.push(ConvBlock::new(dec_features[levels - 1], dec_features[levels], 1, negative_slope, device));
        let mut out_channels = dec_features[levels];

        let full_res = if full_size {
            let block = ConvBlock::new(out_channels + in_channels, dec_features[levels + 1], 1, negative_slope, device);
            out_channels = dec_features[levels + 1];
            Some(block)
        } else {
            None
        };

        let extra = if dec_features.len() == levels + 3 {
            let block = ConvBlock::new(out_channels, dec_features[levels + 2], 1, negative_slope, device);
            out_channels = dec_features[levels + 2];
            Some(block)
        } else {
            None
        };

        Self {
            encoder,
            decoder,
            full_res,
            extra,
            out_channels,
        }
    }

    /// Channels of the feature map returned by [`UnetCore::forward`].
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut skips = Vec::with_capacity(self.encoder.len() + 1);
        skips.push(x);
        for block in &self.encoder {
            let next = block.forward(skips[skips.len() - 1].clone());
            skips.push(next);
        }

        let levels = self.encoder.len();
        let mut x = self.decoder[0].forward(skips[levels].clone());
        for k in 1..levels {
            let up = upsample_nearest(x);
            x = self.decoder[k].forward(Tensor::cat(vec![up, skips[levels - k].clone()], 1));
        }
        x = self.decoder[levels].forward(x);

        if let Some(block) = &self.full_res {
            let up = upsample_nearest(x);
            x = block.forward(Tensor::cat(vec![up, skips[0].clone()], 1));
        }

        if let Some(block) = &self.extra {
            x = block.forward(x);
        }

        x
    }
}
