//! Purpose: Built-in pixel operations registered with the operation registry.
//! Exports: `CLASSES`.
//! Role: Small catalog covering every property kind the binding marshals.
//! Invariants: Image outputs are lazy; statistics outputs evaluate during build.
use std::sync::Arc;

use super::abi::{
    VX_TYPE_ARRAY_DOUBLE, VX_TYPE_ARRAY_IMAGE, VX_TYPE_BAND_FORMAT, VX_TYPE_BOOLEAN,
    VX_TYPE_DIRECTION, VX_TYPE_DOUBLE, VX_TYPE_IMAGE, VX_TYPE_INT,
};
use super::image::{self, BandFormat, ImageData, Pixels};
use super::object::ObjRef;
use super::registry::{ArgSpec, Args, OpClass};
use super::value::Prop;

pub(crate) static CLASSES: &[&OpClass] = &[
    &BLACK,
    &INVERT,
    &LINEAR,
    &ADD,
    &EXTRACT_AREA,
    &FLIP,
    &CAST,
    &BANDJOIN,
    &COPY,
    &AVG,
    &MIN,
    &MAX,
    &GETPOINT,
];

pub(crate) fn header(object: &ObjRef) -> Result<&ImageData, String> {
    object.image().ok_or_else(|| "object is not an image".to_string())
}

/// New image with `template`'s size and resolution whose samples come from `eval`.
pub(crate) fn derived(
    template: &ImageData,
    format: BandFormat,
    bands: usize,
    eval: impl Fn() -> Result<Vec<f64>, String> + Send + Sync + 'static,
) -> Prop {
    let data = template.derive(format, bands, Pixels::Derived(Box::new(eval)));
    Prop::Object(image::create(data))
}

/// Samples of the image held by `object`.
fn pull(object: &ObjRef) -> Result<Arc<Vec<f64>>, String> {
    header(object)?.samples()
}

static BLACK: OpClass = OpClass {
    nickname: c"black",
    description: c"make a black image",
    args: &[
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 1),
        ArgSpec::input(c"width", c"Image width in pixels", VX_TYPE_INT, 4),
        ArgSpec::input(c"height", c"Image height in pixels", VX_TYPE_INT, 5),
        ArgSpec::optional_input(c"bands", c"Number of bands in image", VX_TYPE_INT, 6),
    ],
    build: build_black,
};

fn build_black(args: &mut Args<'_>) -> Result<(), String> {
    let width = args.int("width")?;
    let height = args.int("height")?;
    let bands = args.opt_int("bands").unwrap_or(1);
    if width <= 0 || height <= 0 || bands <= 0 {
        return Err(format!("bad dimensions {width}x{height}x{bands}"));
    }
    let (width, height, bands) = (width as usize, height as usize, bands as usize);
    let samples =
        image::checked_samples(width, height, bands).ok_or_else(|| "image too large".to_string())?;
    let pixels = Pixels::Memory(vec![0; samples]);
    let data = ImageData::new(width, height, bands, BandFormat::Uchar, pixels);
    args.set("out", Prop::Object(image::create(data)));
    Ok(())
}

static INVERT: OpClass = OpClass {
    nickname: c"invert",
    description: c"invert an image",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
    ],
    build: build_invert,
};

fn build_invert(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("in")?;
    let source = header(&input)?;
    let format = source.format;
    let upstream = input.clone();
    let out = derived(source, format, source.bands, move || {
        let samples = pull(&upstream)?;
        Ok(samples
            .iter()
            .map(|value| match format.unsigned_max() {
                Some(max) => max - value,
                None => -value,
            })
            .collect())
    });
    args.set("out", out);
    Ok(())
}

static LINEAR: OpClass = OpClass {
    nickname: c"linear",
    description: c"calculate (a * in + b)",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::input(c"a", c"Multiply by this", VX_TYPE_ARRAY_DOUBLE, 3),
        ArgSpec::input(c"b", c"Add this", VX_TYPE_ARRAY_DOUBLE, 4),
        ArgSpec::optional_input(c"uchar", c"Output should be uchar", VX_TYPE_BOOLEAN, 5),
    ],
    build: build_linear,
};

fn per_band(name: &str, vector: &[f64], bands: usize) -> Result<(), String> {
    if vector.len() == 1 || vector.len() == bands {
        Ok(())
    } else {
        Err(format!(
            "vector \"{name}\" must have 1 or {bands} elements, not {}",
            vector.len()
        ))
    }
}

fn build_linear(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("in")?;
    let a = args.array_double("a")?;
    let b = args.array_double("b")?;
    let source = header(&input)?;
    let bands = source.bands;
    per_band("a", &a, bands)?;
    per_band("b", &b, bands)?;
    let format = if args.bool_or("uchar", false) {
        BandFormat::Uchar
    } else if source.format == BandFormat::Double {
        BandFormat::Double
    } else {
        BandFormat::Float
    };
    let upstream = input.clone();
    let out = derived(source, format, bands, move || {
        let samples = pull(&upstream)?;
        Ok(samples
            .iter()
            .enumerate()
            .map(|(index, value)| {
                let band = index % bands;
                let scale = a[if a.len() == 1 { 0 } else { band }];
                let offset = b[if b.len() == 1 { 0 } else { band }];
                format.clip(scale * value + offset)
            })
            .collect())
    });
    args.set("out", out);
    Ok(())
}

static ADD: OpClass = OpClass {
    nickname: c"add",
    description: c"add two images",
    args: &[
        ArgSpec::input(c"left", c"Left-hand image argument", VX_TYPE_IMAGE, 1),
        ArgSpec::input(c"right", c"Right-hand image argument", VX_TYPE_IMAGE, 2),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 3),
    ],
    build: build_add,
};

/// Sum format: the wider input, with integer types promoted one step.
fn add_format(left: BandFormat, right: BandFormat) -> BandFormat {
    match left.max(right) {
        BandFormat::Uchar => BandFormat::Ushort,
        BandFormat::Char => BandFormat::Short,
        BandFormat::Ushort => BandFormat::Uint,
        BandFormat::Short => BandFormat::Int,
        wider => wider,
    }
}

fn build_add(args: &mut Args<'_>) -> Result<(), String> {
    let left = args.image("left")?;
    let right = args.image("right")?;
    let (lhs, rhs) = (header(&left)?, header(&right)?);
    if lhs.width != rhs.width || lhs.height != rhs.height {
        return Err("images must match in size".to_string());
    }
    if lhs.bands != rhs.bands && lhs.bands != 1 && rhs.bands != 1 {
        return Err("images must have the same number of bands, or one must be single-band".into());
    }
    let bands = lhs.bands.max(rhs.bands);
    let format = add_format(lhs.format, rhs.format);
    let (left_bands, right_bands) = (lhs.bands, rhs.bands);
    let (left, right) = (left.clone(), right.clone());
    let out = derived(lhs, format, bands, move || {
        let (a, b) = (pull(&left)?, pull(&right)?);
        let pixels = a.len() / left_bands;
        let mut out = Vec::with_capacity(pixels * bands);
        for pixel in 0..pixels {
            for band in 0..bands {
                let x = a[pixel * left_bands + band.min(left_bands - 1)];
                let y = b[pixel * right_bands + band.min(right_bands - 1)];
                out.push(format.clip(x + y));
            }
        }
        Ok(out)
    });
    args.set("out", out);
    Ok(())
}

static EXTRACT_AREA: OpClass = OpClass {
    nickname: c"extract_area",
    description: c"extract an area from an image",
    args: &[
        ArgSpec::input(c"input", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::input(c"left", c"Left edge of extract area", VX_TYPE_INT, 3),
        ArgSpec::input(c"top", c"Top edge of extract area", VX_TYPE_INT, 4),
        ArgSpec::input(c"width", c"Width of extract area", VX_TYPE_INT, 5),
        ArgSpec::input(c"height", c"Height of extract area", VX_TYPE_INT, 6),
    ],
    build: build_extract_area,
};

fn build_extract_area(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("input")?;
    let (left, top) = (args.int("left")?, args.int("top")?);
    let (width, height) = (args.int("width")?, args.int("height")?);
    let source = header(&input)?;
    let fits = left >= 0
        && top >= 0
        && width > 0
        && height > 0
        && left as usize + width as usize <= source.width
        && top as usize + height as usize <= source.height;
    if !fits {
        return Err("bad extract area".to_string());
    }
    let (left, top, width, height) = (left as usize, top as usize, width as usize, height as usize);
    let mut data = source.derive(source.format, source.bands, Pixels::Memory(Vec::new()));
    data.width = width;
    data.height = height;
    let upstream = input.clone();
    let eval = move || {
        let source = header(&upstream)?;
        let samples = source.samples()?;
        let mut out = Vec::with_capacity(width * height * source.bands);
        for y in top..top + height {
            let start = source.index(left, y, 0);
            out.extend_from_slice(&samples[start..start + width * source.bands]);
        }
        Ok(out)
    };
    let data = data.derive(source.format, source.bands, Pixels::Derived(Box::new(eval)));
    args.set("out", Prop::Object(image::create(data)));
    Ok(())
}

static FLIP: OpClass = OpClass {
    nickname: c"flip",
    description: c"flip an image",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::input(c"direction", c"Direction to flip image", VX_TYPE_DIRECTION, 3),
    ],
    build: build_flip,
};

fn build_flip(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("in")?;
    let horizontal = match args.enum_value("direction")? {
        0 => true,
        1 => false,
        other => return Err(format!("bad direction {other}")),
    };
    let source = header(&input)?;
    let upstream = input.clone();
    let out = derived(source, source.format, source.bands, move || {
        let source = header(&upstream)?;
        let samples = source.samples()?;
        let mut out = Vec::with_capacity(samples.len());
        for y in 0..source.height {
            for x in 0..source.width {
                let (sx, sy) = if horizontal {
                    (source.width - 1 - x, y)
                } else {
                    (x, source.height - 1 - y)
                };
                let start = source.index(sx, sy, 0);
                out.extend_from_slice(&samples[start..start + source.bands]);
            }
        }
        Ok(out)
    });
    args.set("out", out);
    Ok(())
}

static CAST: OpClass = OpClass {
    nickname: c"cast",
    description: c"cast an image",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::input(c"format", c"Format to cast to", VX_TYPE_BAND_FORMAT, 3),
    ],
    build: build_cast,
};

fn build_cast(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("in")?;
    let raw = args.enum_value("format")?;
    let format = BandFormat::from_raw(raw).ok_or_else(|| format!("bad format {raw}"))?;
    let source = header(&input)?;
    let upstream = input.clone();
    let out = derived(source, format, source.bands, move || {
        let samples = pull(&upstream)?;
        Ok(samples.iter().map(|value| format.clip(*value)).collect())
    });
    args.set("out", out);
    Ok(())
}

static BANDJOIN: OpClass = OpClass {
    nickname: c"bandjoin",
    description: c"bandwise join a set of images",
    args: &[
        ArgSpec::input(c"in", c"Array of input images", VX_TYPE_ARRAY_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
    ],
    build: build_bandjoin,
};

fn build_bandjoin(args: &mut Args<'_>) -> Result<(), String> {
    let inputs = args.images("in")?;
    let Some(first) = inputs.first() else {
        return Err("no input images".to_string());
    };
    let template = header(first)?;
    let mut bands = 0;
    let mut format = template.format;
    let mut layout = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let data = header(input)?;
        if data.width != template.width || data.height != template.height {
            return Err("images must match in size".to_string());
        }
        bands += data.bands;
        if image::checked_samples(template.width, template.height, bands).is_none() {
            return Err("image too large".to_string());
        }
        format = format.max(data.format);
        layout.push(data.bands);
    }
    let upstream = inputs.clone();
    let total = bands;
    let out = derived(template, format, bands, move || {
        let pulled = upstream.iter().map(pull).collect::<Result<Vec<_>, _>>()?;
        let pixels = pulled[0].len() / layout[0];
        let mut out = Vec::with_capacity(pixels * total);
        for pixel in 0..pixels {
            for (samples, width) in pulled.iter().zip(&layout) {
                out.extend_from_slice(&samples[pixel * width..(pixel + 1) * width]);
            }
        }
        Ok(out)
    });
    args.set("out", out);
    Ok(())
}

static COPY: OpClass = OpClass {
    nickname: c"copy",
    description: c"copy an image",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::optional_input(c"xres", c"Horizontal resolution in pixels/mm", VX_TYPE_DOUBLE, 3),
        ArgSpec::optional_input(c"yres", c"Vertical resolution in pixels/mm", VX_TYPE_DOUBLE, 4),
    ],
    build: build_copy,
};

fn build_copy(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("in")?;
    let source = header(&input)?;
    let upstream = input.clone();
    let eval = move || pull(&upstream).map(|samples| samples.as_ref().clone());
    let mut data = source.derive(source.format, source.bands, Pixels::Derived(Box::new(eval)));
    data.xres = args.opt_double("xres").unwrap_or(source.xres);
    data.yres = args.opt_double("yres").unwrap_or(source.yres);
    data.filename = source.filename.clone();
    args.set("out", Prop::Object(image::create(data)));
    Ok(())
}

static AVG: OpClass = OpClass {
    nickname: c"avg",
    description: c"find image average",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output value", VX_TYPE_DOUBLE, 2),
    ],
    build: build_avg,
};

fn build_avg(args: &mut Args<'_>) -> Result<(), String> {
    let samples = pull(&args.image("in")?)?;
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    args.set("out", Prop::Double(mean));
    Ok(())
}

static MIN: OpClass = OpClass {
    nickname: c"min",
    description: c"find image minimum",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output value", VX_TYPE_DOUBLE, 2),
        ArgSpec::optional_output(c"x", c"Horizontal position of minimum", VX_TYPE_INT, 3),
        ArgSpec::optional_output(c"y", c"Vertical position of minimum", VX_TYPE_INT, 4),
    ],
    build: build_min,
};

static MAX: OpClass = OpClass {
    nickname: c"max",
    description: c"find image maximum",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out", c"Output value", VX_TYPE_DOUBLE, 2),
        ArgSpec::optional_output(c"x", c"Horizontal position of maximum", VX_TYPE_INT, 3),
        ArgSpec::optional_output(c"y", c"Vertical position of maximum", VX_TYPE_INT, 4),
    ],
    build: build_max,
};

fn build_min(args: &mut Args<'_>) -> Result<(), String> {
    extreme(args, |candidate, best| candidate < best)
}

fn build_max(args: &mut Args<'_>) -> Result<(), String> {
    extreme(args, |candidate, best| candidate > best)
}

/// First sample that beats every other under `better`, and its position.
fn extreme(args: &mut Args<'_>, better: fn(f64, f64) -> bool) -> Result<(), String> {
    let input = args.image("in")?;
    let source = header(&input)?;
    let samples = source.samples()?;
    let mut best = 0;
    for (index, value) in samples.iter().enumerate() {
        if better(*value, samples[best]) {
            best = index;
        }
    }
    let pixel = best / source.bands;
    args.set("out", Prop::Double(samples[best]));
    args.set("x", Prop::Int((pixel % source.width) as i32));
    args.set("y", Prop::Int((pixel / source.width) as i32));
    Ok(())
}

static GETPOINT: OpClass = OpClass {
    nickname: c"getpoint",
    description: c"read a point from an image",
    args: &[
        ArgSpec::input(c"in", c"Input image", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"out_array", c"Array of output values", VX_TYPE_ARRAY_DOUBLE, 2),
        ArgSpec::input(c"x", c"Point to read", VX_TYPE_INT, 3),
        ArgSpec::input(c"y", c"Point to read", VX_TYPE_INT, 4),
    ],
    build: build_getpoint,
};

fn build_getpoint(args: &mut Args<'_>) -> Result<(), String> {
    let input = args.image("in")?;
    let (x, y) = (args.int("x")?, args.int("y")?);
    let source = header(&input)?;
    if x < 0 || y < 0 || x as usize >= source.width || y as usize >= source.height {
        return Err(format!("point ({x}, {y}) out of range"));
    }
    let samples = source.samples()?;
    let start = source.index(x as usize, y as usize, 0);
    let values = samples[start..start + source.bands].to_vec();
    args.set("out_array", Prop::ArrayDouble(values));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(width: usize, height: usize, bands: usize, bytes: Vec<u8>) -> ObjRef {
        image::create(ImageData::new(
            width,
            height,
            bands,
            BandFormat::Uchar,
            Pixels::Memory(bytes),
        ))
    }

    #[test]
    fn add_promotes_integer_formats() {
        assert_eq!(add_format(BandFormat::Uchar, BandFormat::Uchar), BandFormat::Ushort);
        assert_eq!(add_format(BandFormat::Char, BandFormat::Uchar), BandFormat::Short);
        assert_eq!(add_format(BandFormat::Int, BandFormat::Float), BandFormat::Float);
    }

    #[test]
    fn derived_image_keeps_upstream_alive() {
        let input = memory(2, 1, 1, vec![10, 250]);
        let template = header(&input).expect("image");
        let upstream = input.clone();
        let prop = derived(template, BandFormat::Uchar, 1, move || {
            Ok(pull(&upstream)?.iter().map(|value| 255.0 - value).collect())
        });
        drop(input);
        let Prop::Object(out) = prop else {
            panic!("expected image");
        };
        let bytes = header(&out).expect("image").encode().expect("encode");
        assert_eq!(bytes, vec![245, 5]);
    }
}
