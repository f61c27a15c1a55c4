use super::processor::BatchEncoding;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::{
    generation::{LogitsProcessor, Sampling},
    models::qwen3_vl::{Config, Qwen3VLModel},
};
use std::ops::Range;

/// Greedy generation over a tokenized batch.
///
/// Returns one sequence per row: the row as it was fed in (padding included)
/// followed by the generated tokens. Rows may end at different lengths.
pub trait Generate {
    fn generate(
        &mut self,
        batch: &BatchEncoding,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>>;

    fn device(&self) -> &Device;

    /// Positions the backend can hold for one sequence, prompt included.
    fn max_positions(&self) -> Option<usize> {
        None
    }
}

/// One row of a batch with its left padding located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInput {
    pub padded: Vec<u32>,
    /// Index of the first real token.
    pub start: usize,
    /// Entries of `BatchEncoding::pixel_values` belonging to this row.
    pub images: Range<usize>,
}

impl RowInput {
    pub fn prompt(&self) -> &[u32] {
        &self.padded[self.start..]
    }

    /// `padded ++ generated`, the shape the driver trims by input length.
    pub fn into_output(self, generated: Vec<u32>) -> Vec<u32> {
        let mut output = self.padded;
        output.extend(generated);
        output
    }
}

pub fn split_rows(batch: &BatchEncoding) -> anyhow::Result<Vec<RowInput>> {
    let rows = batch.input_rows()?;
    let masks = batch.attention_rows()?;
    if rows.len() != batch.image_ranges.len() {
        anyhow::bail!(
            "batch has {} rows but {} image ranges",
            rows.len(),
            batch.image_ranges.len()
        );
    }

    Ok(rows
        .into_iter()
        .zip(masks)
        .zip(&batch.image_ranges)
        .map(|((padded, mask), images)| RowInput {
            start: row_start(&mask),
            padded,
            images: images.clone(),
        })
        .collect())
}

/// First unmasked position, or the row length for a fully masked row.
pub fn row_start(mask: &[u8]) -> usize {
    mask.iter().position(|&m| m != 0).unwrap_or(mask.len())
}

/// New tokens a prompt of `prompt_len` may still take within `max_positions`.
pub fn row_budget(max_new_tokens: usize, prompt_len: usize, max_positions: Option<usize>) -> usize {
    match max_positions {
        Some(cap) => max_new_tokens.min(cap.saturating_sub(prompt_len)),
        None => max_new_tokens,
    }
}

/// Pixel values and grids of `range`, concatenated for a single forward pass.
pub fn row_images(
    batch: &BatchEncoding,
    range: Range<usize>,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<(Option<Tensor>, Option<Tensor>)> {
    if range.is_empty() {
        return Ok((None, None));
    }

    let pixel_values = Tensor::cat(&batch.pixel_values[range.clone()], 0)?
        .to_dtype(dtype)?
        .to_device(device)?;
    let grid_thw = batch
        .image_grid_thw
        .narrow(0, range.start, range.len())?
        .to_device(device)?;

    Ok((Some(pixel_values), Some(grid_thw)))
}

/// Calls `step` with the previous token (`None` for the prefill) until it yields a
/// stop token or `max_new_tokens` are produced. The stop token is kept.
pub fn greedy_decode<F>(
    max_new_tokens: usize,
    stop_tokens: &[u32],
    mut step: F,
) -> anyhow::Result<Vec<u32>>
where
    F: FnMut(Option<u32>) -> anyhow::Result<u32>,
{
    let mut generated = Vec::new();
    let mut previous = None;

    while generated.len() < max_new_tokens {
        let token = step(previous)?;
        generated.push(token);
        if stop_tokens.contains(&token) {
            break;
        }
        previous = Some(token);
    }

    Ok(generated)
}

pub struct Qwen3VLGenerator {
    model: Qwen3VLModel,
    config: Config,
    device: Device,
    dtype: DType,
    stop_tokens: Vec<u32>,
    logits_processor: LogitsProcessor,
}

impl Qwen3VLGenerator {
    pub fn new(
        model: Qwen3VLModel,
        config: Config,
        device: Device,
        dtype: DType,
        stop_tokens: Vec<u32>,
        seed: u64,
    ) -> Self {
        Self {
            model,
            config,
            device,
            dtype,
            stop_tokens,
            logits_processor: LogitsProcessor::from_sampling(seed, Sampling::ArgMax),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    // Padding is stripped before the forward pass, so every row runs unmasked
    // from position 0.
    fn generate_row(
        &mut self,
        ids: &[u32],
        pixel_values: Option<Tensor>,
        grid_thw: Option<Tensor>,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<u32>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let budget = row_budget(max_new_tokens, ids.len(), self.max_positions());
        let spans = image_spans(ids, self.config.image_token_id);
        let Self {
            model,
            device,
            stop_tokens,
            logits_processor,
            ..
        } = self;

        let (mut pixel_values, mut grid_thw) = (pixel_values, grid_thw);
        let mut spans = Some(spans);
        let mut offset = ids.len();

        greedy_decode(budget, stop_tokens, |previous| {
            let logits = match previous {
                None => model.forward(
                    &Tensor::new(ids, device)?.unsqueeze(0)?,
                    pixel_values.take(),
                    None,
                    grid_thw.take(),
                    None,
                    vec![ids.len()],
                    vec![spans.take().unwrap_or_default()],
                    vec![vec![]],
                    &[0],
                )?,
                Some(token) => {
                    let logits = model.forward(
                        &Tensor::new(&[token], device)?.unsqueeze(0)?,
                        None,
                        None,
                        None,
                        None,
                        vec![1],
                        vec![vec![]],
                        vec![vec![]],
                        &[offset],
                    )?;
                    offset += 1;
                    logits
                }
            };

            let logits = last_token_logits(&logits)?.to_dtype(DType::F32)?;
            Ok(logits_processor.sample(&logits)?)
        })
    }
}

impl Generate for Qwen3VLGenerator {
    fn generate(
        &mut self,
        batch: &BatchEncoding,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        let mut outputs = Vec::with_capacity(batch.batch_size());

        for row in split_rows(batch)? {
            let (pixel_values, grid_thw) =
                row_images(batch, row.images.clone(), self.dtype, &self.device)?;

            let generated =
                self.generate_row(row.prompt(), pixel_values, grid_thw, max_new_tokens)?;
            tracing::debug!(
                "generated {} tokens after {} prompt tokens",
                generated.len(),
                row.prompt().len()
            );

            outputs.push(row.into_output(generated));
        }

        Ok(outputs)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn max_positions(&self) -> Option<usize> {
        Some(self.config.text_config.max_position_embeddings)
    }
}

/// Half-open spans of consecutive `image_token_id` runs, one per image.
pub fn image_spans(ids: &[u32], image_token_id: u32) -> Vec<(usize, usize)> {
    let mut spans = vec![];
    let mut start = None;

    for (i, &id) in ids.iter().enumerate() {
        match (id == image_token_id, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, ids.len()));
    }

    spans
}

/// Logits of the final position as a `(vocab,)` tensor.
pub fn last_token_logits(logits: &Tensor) -> anyhow::Result<Tensor> {
    let last = match logits.rank() {
        3 => logits.i((0, logits.dim(1)? - 1))?,
        2 => logits.i(logits.dim(0)? - 1)?,
        1 => logits.clone(),
        n => anyhow::bail!("unexpected logits rank {}: {:?}", n, logits.shape()),
    };
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qwen3_vl::{
        processor::{IMAGE_PAD, IM_END, IM_START, VISION_END, VISION_START},
        testing::{test_processor, white_image, IDS},
    };

    fn mixed_batch() -> BatchEncoding {
        let with_image = format!("{IM_START}user\n{VISION_START}{IMAGE_PAD}{VISION_END}hello{IM_END}\n");
        let text_only = format!("{IM_START}user\nhello{IM_END}\n");
        let two_images = format!(
            "{IM_START}user\n{VISION_START}{IMAGE_PAD}{VISION_END}{VISION_START}{IMAGE_PAD}{VISION_END}{IM_END}\n"
        );
        let (a, b, c) = (white_image(64, 32), white_image(32, 64), white_image(64, 64));

        test_processor()
            .encode_batch(&[with_image, text_only, two_images], &[&a, &b, &c])
            .unwrap()
    }

    #[test]
    fn row_start_skips_left_padding() {
        assert_eq!(row_start(&[0, 0, 1, 1]), 2);
        assert_eq!(row_start(&[1, 1]), 0);
        assert_eq!(row_start(&[0, 0]), 2);
        assert_eq!(row_start(&[]), 0);
    }

    #[test]
    fn rows_carry_their_prompt_and_images() {
        let batch = mixed_batch();
        let rows = split_rows(&batch).unwrap();
        assert_eq!(rows.len(), 3);

        let seq_len = rows[0].padded.len();
        assert!(rows.iter().all(|row| row.padded.len() == seq_len));

        // the text-only row is the shortest, so it carries padding
        assert_eq!(
            rows[1].prompt(),
            &[IDS.im_start, IDS.user, IDS.hello, IDS.im_end]
        );
        assert_eq!(rows[1].start, seq_len - 4);
        assert!(rows[1].padded[..rows[1].start]
            .iter()
            .all(|&id| id == IDS.pad));

        assert_eq!(rows[0].images, 0..1);
        assert_eq!(rows[1].images, 1..1);
        assert_eq!(rows[2].images, 1..3);
        for row in &rows {
            assert_eq!(row.prompt()[0], IDS.im_start);
        }
    }

    #[test]
    fn row_images_follow_ranges() {
        let batch = mixed_batch();

        let (pixels, grid) = row_images(&batch, 1..1, DType::F32, &Device::Cpu).unwrap();
        assert!(pixels.is_none() && grid.is_none());

        let (pixels, grid) = row_images(&batch, 0..1, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(pixels.unwrap().dims(), &[8, 1536]);
        assert_eq!(grid.unwrap().to_vec2::<u32>().unwrap(), vec![vec![1, 2, 4]]);

        // two images of 8 and 16 patches concatenate along the patch axis
        let (pixels, grid) = row_images(&batch, 1..3, DType::F16, &Device::Cpu).unwrap();
        let pixels = pixels.unwrap();
        assert_eq!(pixels.dims(), &[8 + 16, 1536]);
        assert_eq!(pixels.dtype(), DType::F16);
        assert_eq!(
            grid.unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![1, 4, 2], vec![1, 4, 4]]
        );
    }

    #[test]
    fn output_is_padded_row_then_generated() {
        let row = RowInput {
            padded: vec![IDS.pad, IDS.im_start, IDS.hello],
            start: 1,
            images: 0..0,
        };
        let input_len = row.padded.len();
        let output = row.into_output(vec![IDS.world, IDS.im_end]);

        assert_eq!(
            output,
            vec![IDS.pad, IDS.im_start, IDS.hello, IDS.world, IDS.im_end]
        );
        assert_eq!(&output[input_len..], &[IDS.world, IDS.im_end]);
    }

    #[test]
    fn decoding_stops_at_stop_token_and_keeps_it() {
        let stop = [IDS.im_end, IDS.pad];
        let script = [IDS.hello, IDS.world, IDS.im_end, IDS.hello];
        let mut seen = vec![];

        let generated = greedy_decode(10, &stop, |previous| {
            seen.push(previous);
            Ok(script[seen.len() - 1])
        })
        .unwrap();

        assert_eq!(generated, vec![IDS.hello, IDS.world, IDS.im_end]);
        assert_eq!(seen, vec![None, Some(IDS.hello), Some(IDS.world)]);

        let generated = greedy_decode(10, &stop, |_| Ok(IDS.pad)).unwrap();
        assert_eq!(generated, vec![IDS.pad]);
    }

    #[test]
    fn decoding_respects_budget() {
        let mut calls = 0;
        let generated = greedy_decode(3, &[IDS.im_end], |_| {
            calls += 1;
            Ok(IDS.world)
        })
        .unwrap();
        assert_eq!(generated, vec![IDS.world; 3]);
        assert_eq!(calls, 3);

        let generated = greedy_decode(0, &[IDS.im_end], |_| -> anyhow::Result<u32> {
            panic!("no forward pass for an empty budget")
        })
        .unwrap();
        assert!(generated.is_empty());

        assert!(greedy_decode(3, &[], |_| anyhow::bail!("forward failed")).is_err());
    }

    #[test]
    fn budget_fits_position_cap() {
        assert_eq!(row_budget(100, 50, None), 100);
        assert_eq!(row_budget(100, 50, Some(1000)), 100);
        assert_eq!(row_budget(100, 950, Some(1000)), 50);
        assert_eq!(row_budget(100, 1200, Some(1000)), 0);
    }

    #[test]
    fn spans_cover_each_image_run() {
        assert_eq!(image_spans(&[1, 2, 3], 9), vec![]);
        assert_eq!(image_spans(&[1, 9, 9, 2, 9, 3], 9), vec![(1, 3), (4, 5)]);
        assert_eq!(image_spans(&[9, 9], 9), vec![(0, 2)]);
    }

    #[test]
    fn last_position_is_selected() {
        let logits = Tensor::arange(0f32, 12., &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 4))
            .unwrap();
        let last = last_token_logits(&logits).unwrap();
        assert_eq!(last.to_vec1::<f32>().unwrap(), vec![8., 9., 10., 11.]);

        let logits = logits.squeeze(0).unwrap();
        let last = last_token_logits(&logits).unwrap();
        assert_eq!(last.to_vec1::<f32>().unwrap(), vec![8., 9., 10., 11.]);

        let scalar = Tensor::new(1f32, &Device::Cpu).unwrap();
        assert!(last_token_logits(&scalar).is_err());
    }
}
