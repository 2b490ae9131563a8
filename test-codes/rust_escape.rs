// Isolation probe: each check prints OK (contained) or ESCAPED
use std::fs;
use std::net::TcpStream;
use std::process::Command;
use std::time::Duration;

fn report(name: &str, escaped: bool) {
    println!("{}: {}", name, if escaped { "ESCAPED" } else { "OK" });
}

fn main() {
    // Whatever can be spawned must not run as root
    let as_root = Command::new("id")
        .arg("-u")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false);
    report("spawn-as-root", as_root);

    let addr = "1.1.1.1:80".parse().unwrap();
    report("network", TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok());

    report("write-root", fs::write("/escape.txt", "x").is_ok());
    report("write-etc", fs::write("/etc/escape.txt", "x").is_ok());
    report("write-workspace", fs::write("/workspace/escape.txt", "x").is_ok());

    let docker_sock = fs::metadata("/var/run/docker.sock").is_ok();
    report("docker-socket", docker_sock);
}
