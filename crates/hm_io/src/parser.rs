//! Parser for hardware image descriptors.
//!
//! A descriptor is a line-oriented text file. `#` starts a comment and blank
//! lines are ignored. Each remaining line holds one directive:
//!
//! ```text
//! image vadd_hostmem
//! bandwidth 12000
//! kernel vadd latency_us=180
//! cu vadd vadd_1
//! cu vadd vadd_2
//! ```
//!
//! `bandwidth` is the host link speed in MB/s and may be omitted for
//! instantaneous transfers. Compute units are numbered in file order.

use anyhow::{Context, Result, anyhow, bail};
use hm_core::image::{DeviceImage, KernelSelector};
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, space0, space1, u64 as decimal};
use nom::combinator::{all_consuming, map, opt};
use nom::sequence::{delimited, preceded, terminated, tuple};
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
enum Directive<'a> {
    Image(&'a str),
    Bandwidth(u64),
    Kernel {
        name: &'a str,
        latency_us: Option<u64>,
    },
    Cu {
        kernel: &'a str,
        instance: &'a str,
    },
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(word), space1)
}

fn directive(input: &str) -> IResult<&str, Directive<'_>> {
    alt((
        map(preceded(keyword("image"), ident), Directive::Image),
        map(preceded(keyword("bandwidth"), decimal), Directive::Bandwidth),
        map(
            tuple((
                preceded(keyword("kernel"), ident),
                opt(preceded(tuple((space1, tag("latency_us="))), decimal)),
            )),
            |(name, latency_us)| Directive::Kernel { name, latency_us },
        ),
        map(
            tuple((preceded(keyword("cu"), ident), preceded(space1, ident))),
            |(kernel, instance)| Directive::Cu { kernel, instance },
        ),
    ))(input)
}

fn line(input: &str) -> IResult<&str, Directive<'_>> {
    all_consuming(delimited(space0, directive, space0))(input)
}

/// Parses a descriptor into a validated image.
///
/// # Arguments
///
/// * `text` - Descriptor contents
///
/// # Returns
///
/// The image, or an error naming the first offending line.
pub fn parse_image(text: &str) -> Result<DeviceImage> {
    let mut image = DeviceImage::default();
    let mut named = false;
    let mut bandwidth = false;

    for (index, raw) in text.lines().enumerate() {
        let lineno = index + 1;
        let content = raw.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }

        let (_, parsed) =
            line(content).map_err(|_| anyhow!("line {}: cannot parse `{}`", lineno, content))?;

        match parsed {
            Directive::Image(name) => {
                if named {
                    bail!("line {}: image named twice", lineno);
                }
                image.name = name.to_string();
                named = true;
            }
            Directive::Bandwidth(mbps) => {
                if bandwidth {
                    bail!("line {}: bandwidth given twice", lineno);
                }
                image.bandwidth_mbps = Some(mbps);
                bandwidth = true;
            }
            Directive::Kernel { name, latency_us } => {
                image = image.with_kernel(name, Duration::from_micros(latency_us.unwrap_or(0)));
            }
            Directive::Cu { kernel, instance } => {
                image = image.with_compute_unit(kernel, instance);
            }
        }
    }

    image.validate().context("image descriptor rejected")?;
    Ok(image)
}

/// Parses a compute-unit selector such as `vadd:{vadd_1}` or `vadd`.
pub fn parse_selector(text: &str) -> Result<KernelSelector> {
    let selector = tuple((
        ident,
        opt(preceded(char(':'), delimited(char('{'), ident, char('}')))),
    ));
    let (_, (kernel, instance)) = all_consuming(delimited(space0, selector, space0))(text)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| {
            anyhow!("invalid compute unit selector `{}`", text)
        })?;

    Ok(match instance {
        Some(instance) => KernelSelector::instance(kernel, instance),
        None => KernelSelector::kernel(kernel),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::ComputeUnitId;
    use hm_core::image::ComputeUnit;

    const SAMPLE: &str = "\
# two vadd units
image vadd_hostmem
bandwidth 12000   # MB/s

kernel vadd latency_us=180
cu vadd vadd_1
  cu vadd vadd_2
";

    #[test]
    fn parses_sample_descriptor() {
        let image = parse_image(SAMPLE).unwrap();
        assert_eq!(image.name, "vadd_hostmem");
        assert_eq!(image.bandwidth_mbps, Some(12000));
        assert_eq!(image.kernel("vadd").unwrap().latency, Duration::from_micros(180));
        assert_eq!(
            image.compute_units[1],
            ComputeUnit {
                id: ComputeUnitId(1),
                kernel: "vadd".into(),
                instance: "vadd_2".into(),
            }
        );
    }

    #[test]
    fn latency_defaults_to_zero() {
        let image = parse_image("kernel vadd\ncu vadd vadd_1\n").unwrap();
        assert_eq!(image.kernels[0].latency, Duration::ZERO);
        assert_eq!(image.bandwidth_mbps, None);
    }

    #[test]
    fn reports_line_of_bad_directive() {
        let err = parse_image("kernel vadd\ncu vadd\n").unwrap_err();
        assert!(err.to_string().starts_with("line 2:"), "{}", err);

        let err = parse_image("kernel vadd latency_us=fast\n").unwrap_err();
        assert!(err.to_string().starts_with("line 1:"), "{}", err);
    }

    #[test]
    fn rejects_duplicates_and_undeclared_kernels() {
        assert!(parse_image("image a\nimage b\nkernel k\ncu k k1\n").is_err());
        assert!(parse_image("bandwidth 1\nbandwidth 2\nkernel k\ncu k k1\n").is_err());

        let err = parse_image("kernel vadd\ncu vmul vmul_1\n").unwrap_err();
        assert!(format!("{:#}", err).contains("undeclared kernel `vmul`"));
    }

    #[test]
    fn parses_selectors() {
        assert_eq!(
            parse_selector("vadd:{vadd_12}").unwrap(),
            KernelSelector::instance("vadd", "vadd_12")
        );
        assert_eq!(parse_selector("vadd").unwrap(), KernelSelector::kernel("vadd"));
        assert!(parse_selector("vadd:{vadd_1").is_err());
        assert!(parse_selector("vadd:vadd_1").is_err());
        assert!(parse_selector("").is_err());
    }
}
