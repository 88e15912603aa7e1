use gatt_call::{gatt_interface, Call, GattClient, ResponseFuture};
use gatt_call::providers::btleplug_provider::BtleplugDevice;

gatt_interface! {
    pub trait HeartRateService {
        #[read(service = "180d", characteristic = "2a38")]
        fn body_sensor_location() -> Call<String>;
        #[notify(service = "180d", characteristic = "2a37")]
        fn heart_rate_measurement() -> ResponseFuture<Vec<u8>>;
        #[write(service = "180d", characteristic = "2a39")]
        fn heart_rate_control_point(value: Vec<u8>) -> Call<()>;
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <device-name>", args[0]);
        std::process::exit(1);
    }
    let client = GattClient::<BtleplugDevice>::builder()
        .device_by_name(&args[1])
        .await
        .expect("Unable to get device")
        .build()
        .expect("Unable to build client");
    client.connect().await.expect("Unable to connect");
    let service = client.create::<HeartRateService>().expect("Unable to create HeartRateService");

    let location = service.body_sensor_location().execute().await
        .expect("Unable to read body sensor location");
    println!("Body sensor location: {}", location.body().map(String::as_str).unwrap_or("unknown"));

    let measurement = service.heart_rate_measurement().await
        .expect("Unable to receive heart rate measurement");
    match measurement.body() {
        // flags in the first byte, 8 bit value when bit 0 is unset
        Some(value) if value.len() > 1 && value[0] & 0x01 == 0 => println!("Heart rate: {} bpm", value[1]),
        Some(value) => println!("Heart rate measurement: {value:?}"),
        None => println!("Empty heart rate measurement"),
    }

    service.heart_rate_control_point(vec![0x01]).execute().await
        .expect("Unable to reset energy expended");

    client.close().await.expect("Unable to close client");
}
