// 构建脚本: 链接FFmpeg依赖库
fn main() {
    // 仅在启用 ffmpeg 功能且为 Windows MSVC 环境时添加FFmpeg相关库
    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_some() {
        // x264 编码器
        println!("cargo:rustc-link-lib=dylib=libx264");

        // OLE 自动化和VFW (dshow 摄像头)
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=vfw32");

        // Secure Channel (RTSP over TLS)
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
}
