//! Screen layout: indoor section, outdoor section, clock strip.

use core::fmt::Write;

use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::mono_font::ascii::{FONT_6X10, FONT_10X20};
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Line, PrimitiveStyle};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};

use crate::clock::LocalTime;
use crate::view::{FaultFlags, SensorReading, ViewData};

pub const SCREEN_WIDTH: i32 = 280;
pub const SCREEN_HEIGHT: i32 = 480;
pub const TIME_AREA_HEIGHT: i32 = 50;
const ROWS_PER_SECTION: i32 = 5;
const SECTION_HEIGHT: i32 = (SCREEN_HEIGHT - TIME_AREA_HEIGHT) / 2;
const ROW_HEIGHT: i32 = SECTION_HEIGHT / ROWS_PER_SECTION;
const MARGIN: i32 = 8;
const NO_DATA: &str = "---";

type Line24 = heapless::String<24>;

/// Draw the whole screen.
pub fn render<D>(target: &mut D, view: &ViewData, time: LocalTime) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    target.clear(BinaryColor::Off)?;
    draw_section(target, 0, "Indoor", Some(&view.local))?;
    draw_section(target, SECTION_HEIGHT, "Outdoor", view.remote.as_ref())?;
    separator(target, SECTION_HEIGHT)?;
    separator(target, 2 * SECTION_HEIGHT)?;
    draw_clock(target, time, view.local.flags)
}

fn separator<D>(target: &mut D, y: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    Line::new(Point::new(0, y), Point::new(SCREEN_WIDTH - 1, y))
        .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 2))
        .draw(target)
        .map(|_| ())
}

fn text<D>(target: &mut D, s: &str, at: Point, alignment: Alignment, small: bool) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let font = if small { &FONT_6X10 } else { &FONT_10X20 };
    let style = TextStyleBuilder::new()
        .alignment(alignment)
        .baseline(Baseline::Middle)
        .build();
    Text::with_text_style(s, at, MonoTextStyle::new(font, BinaryColor::On), style)
        .draw(target)
        .map(|_| ())
}

fn row_center(top: i32, row: i32) -> i32 {
    top + row * ROW_HEIGHT + ROW_HEIGHT / 2
}

fn fmt_float(value: Option<f32>, decimals: usize, unit: &str) -> Line24 {
    let mut s = Line24::new();
    let _ = match value {
        Some(v) => write!(s, "{:.*}{}", decimals, v, unit),
        None => write!(s, "{}{}", NO_DATA, unit),
    };
    s
}

fn fmt_pm(value: Option<u16>) -> Line24 {
    let mut s = Line24::new();
    let _ = match value {
        Some(v) => write!(s, "{}", v),
        None => s.write_str(NO_DATA),
    };
    s
}

fn draw_section<D>(
    target: &mut D,
    top: i32,
    title: &str,
    reading: Option<&SensorReading>,
) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let left = MARGIN;
    let right = SCREEN_WIDTH - MARGIN;
    let center = SCREEN_WIDTH / 2;
    text(target, title, Point::new(left, row_center(top, 0)), Alignment::Left, false)?;

    let Some(reading) = reading else {
        return text(
            target,
            "no external sensor",
            Point::new(center, row_center(top, 2)),
            Alignment::Center,
            false,
        );
    };

    let volts = fmt_float(reading.voltage, 2, "V");
    text(target, &volts, Point::new(right, row_center(top, 0)), Alignment::Right, false)?;

    let temperature = fmt_float(reading.temperature, 1, " C");
    let humidity = fmt_float(reading.humidity, 0, " %");
    text(target, &temperature, Point::new(left, row_center(top, 1)), Alignment::Left, false)?;
    text(target, &humidity, Point::new(right, row_center(top, 1)), Alignment::Right, false)?;

    let pressure = fmt_float(reading.pressure, 0, " hPa");
    text(target, &pressure, Point::new(left, row_center(top, 2)), Alignment::Left, false)?;

    let columns = [
        (left + 35, "PM1", reading.pm1_0),
        (center, "PM2.5", reading.pm2_5),
        (right - 35, "PM10", reading.pm10),
    ];
    for (x, label, value) in columns {
        text(target, label, Point::new(x, row_center(top, 3)), Alignment::Center, true)?;
        text(target, &fmt_pm(value), Point::new(x, row_center(top, 4)), Alignment::Center, false)?;
    }
    Ok(())
}

fn draw_clock<D>(target: &mut D, time: LocalTime, flags: FaultFlags) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let y = SCREEN_HEIGHT - TIME_AREA_HEIGHT / 2;
    let mut clock = Line24::new();
    let _ = write!(clock, "{:02}:{:02}", time.hour, time.minute);
    text(target, &clock, Point::new(SCREEN_WIDTH / 2, y), Alignment::Center, false)?;
    if flags.contains(FaultFlags::BATTERY_LOW) {
        text(target, "LOW BAT", Point::new(SCREEN_WIDTH - MARGIN, y), Alignment::Right, true)?;
    }
    Ok(())
}
