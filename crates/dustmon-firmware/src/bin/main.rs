#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use dustmon_core::controller::{Board, Controller, Platform, runner};
use dustmon_core::display::ssd1677::Ssd1677;
use dustmon_core::events::RadioEvents;
use dustmon_core::sensors::bme280::{self, Bme280};
use dustmon_core::sensors::sps30::Sps30;
use dustmon_core::storage::RetainedStore;
use dustmon_firmware::board::{AdcBattery, StepUpRail};
use dustmon_firmware::clock::{RtcOscillator, SystemClock};
use dustmon_firmware::radio::{PeerHandle, RadioWorker, StationHandle, net_task, radio_task};
use dustmon_firmware::sleep::{self, DeepSleep, RetainedRegion};
use dustmon_firmware::wifi_secrets;
use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::Async;
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::peripherals::{GPIO1, GPIO4};
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{Config as UartConfig, Uart};
use log::{info, warn};
use static_cell::StaticCell;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static EVENTS: RadioEvents = RadioEvents::new();

type PanelSpi = ExclusiveDevice<Spi<'static, Async>, Output<'static>, Delay>;

struct Esp32s3;

impl Platform for Esp32s3 {
    type Storage = RetainedStore<RetainedRegion>;
    type Clock = SystemClock;
    type Oscillator = RtcOscillator;
    type StepUp = StepUpRail<'static, GPIO4<'static>>;
    type Battery = AdcBattery<'static, GPIO1<'static>>;
    type Meteo = Bme280<I2c<'static, Async>>;
    type Particulate = Sps30<Uart<'static, Async>>;
    type Station = StationHandle;
    type PeerLink = PeerHandle;
    type Display = Ssd1677<PanelSpi, Output<'static>, Output<'static>, Input<'static>, Delay>;
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let woken = sleep::woken_from_deep_sleep();
    info!(" dustmon starting ({})", if woken { "timer wake" } else { "cold boot" });

    // Radio: Wi-Fi station for time sync, ESP-NOW for the companion unit
    static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
    let radio_init = RADIO.init(esp_radio::init().expect("Failed to initialize radio"));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio_init, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    static NET_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
    let (stack, net_runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );
    spawner.spawn(net_task(net_runner)).ok();
    spawner
        .spawn(radio_task(RadioWorker::new(
            wifi_controller,
            interfaces.esp_now,
            stack,
            &EVENTS,
            SystemClock,
        )))
        .ok();

    // BME280 on I2C0
    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    )
    .expect("Failed to initialize I2C")
    .with_sda(peripherals.GPIO8)
    .with_scl(peripherals.GPIO9)
    .into_async();

    // SPS30 in UART mode
    let uart = Uart::new(
        peripherals.UART1,
        UartConfig::default().with_baudrate(115_200),
    )
    .expect("Failed to initialize UART")
    .with_tx(peripherals.GPIO17)
    .with_rx(peripherals.GPIO18)
    .into_async();

    // E-paper panel
    let spi_bus = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(4))
            .with_mode(Mode::_0),
    )
    .expect("Failed to initialize SPI")
    .with_sck(peripherals.GPIO12)
    .with_mosi(peripherals.GPIO11)
    .into_async();
    let cs = Output::new(peripherals.GPIO10, Level::High, OutputConfig::default());
    let spi_device = ExclusiveDevice::new(spi_bus, cs, Delay).expect("Failed to create SPI device");
    let dc = Output::new(peripherals.GPIO13, Level::Low, OutputConfig::default());
    let rst = Output::new(peripherals.GPIO14, Level::High, OutputConfig::default());
    let busy = Input::new(peripherals.GPIO15, InputConfig::default());

    // Step-up converter and battery divider
    // SAFETY: the stolen handle only drives the pad hold of the rail pin.
    let step_up_pad = unsafe { GPIO4::steal() };
    let step_up_enable = Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default());
    let mut adc_config = AdcConfig::new();
    let battery_pin = adc_config.enable_pin(peripherals.GPIO1, Attenuation::_11dB);
    let adc = Adc::new(peripherals.ADC1, adc_config);

    let board: Board<Esp32s3> = Board {
        storage: sleep::retained_store(woken).expect("Retained memory opened twice"),
        clock: SystemClock,
        // SAFETY: nothing else touches the RTC timer or the calibration unit.
        oscillator: unsafe { RtcOscillator::new() },
        step_up: StepUpRail::new(step_up_enable, step_up_pad),
        battery: AdcBattery::new(adc, battery_pin),
        meteo: Bme280::new(i2c, bme280::DEFAULT_ADDRESS),
        particulate: Sps30::new(uart),
        station: StationHandle::default(),
        peer_link: PeerHandle,
        display: Ssd1677::new(spi_device, dc, rst, busy, Delay),
    };

    let mut controller = Controller::new(board, wifi_secrets::config(), &EVENTS);
    if let Err(e) = controller.setup(woken).await {
        warn!(" Setup incomplete: {}", e);
    }

    let mut scheduler = DeepSleep::new(Rtc::new(peripherals.LPWR), &EVENTS);
    runner::run(&mut controller, &mut scheduler).await
}
