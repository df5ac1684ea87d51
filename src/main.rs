// BoxOS kernel binary: boot sequence and panic handler. The bootloader
// drops us in long mode; from here the subsystems come up leaves-first:
// descriptor tables, interrupt plumbing, PIC/PIT, physical then virtual
// memory, the heap, the console, the disk and TagFS, and finally the
// task layer with the interactive shell.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use boxos::physical_memory::{PhysRegion, RegionKind};
    use boxos::shell::shell_task;
    use boxos::vga::{Color, ColorCode};
    use boxos::{arch, ata, block, gdt, heap, idt, paging, physical_memory, pic, pit, tagfs, task};
    use boxos::{println, serial_println};
    use bootloader_api::config::Mapping;
    use bootloader_api::info::MemoryRegionKind;
    use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
    use core::panic::PanicInfo;

    /// Everything below this stays reserved: legacy regions, the early
    /// identity-map working set, and whatever the loader parked in low
    /// memory.
    const MEM_START: u64 = 16 * 1024 * 1024;

    /// Most firmware maps we will bother mirroring.
    const MAX_REGIONS: usize = 64;

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        serial_println!("BoxOS booting...");

        let phys_offset = match boot_info.physical_memory_offset.into_option() {
            Some(offset) => offset,
            None => panic!("bootloader did not map physical memory"),
        };

        // Mirror the firmware map into the shape the PMM consumes.
        let mut regions = [PhysRegion {
            base: 0,
            len: 0,
            kind: RegionKind::Reserved,
        }; MAX_REGIONS];
        let mut region_count = 0;
        for region in boot_info.memory_regions.iter() {
            if region_count == MAX_REGIONS {
                break;
            }
            regions[region_count] = PhysRegion {
                base: region.start,
                len: region.end - region.start,
                kind: match region.kind {
                    MemoryRegionKind::Usable => RegionKind::Usable,
                    _ => RegionKind::Reserved,
                },
            };
            region_count += 1;
        }

        // Platform tables first; nothing else is safe without them.
        unsafe {
            gdt::init();
            idt::init();
            pic::init();
            pit::init(pit::DEFAULT_FREQUENCY_HZ);
        }
        assert!(gdt::verify_loaded(), "GDT/TSS verification failed");
        assert!(idt::verify_loaded(), "IDT verification failed");
        serial_println!("descriptor tables installed and verified");

        // Memory: frames, then page tables and the identity map, then
        // the demand-paged heap window.
        physical_memory::init(&regions[..region_count], MEM_START);
        serial_println!(
            "pmm: {} frames free",
            physical_memory::free_frames()
        );
        unsafe {
            paging::init(phys_offset);
            heap::init();
        }
        serial_println!("vmm + heap online");

        // Interrupts can flow now that every handler's state exists.
        arch::sti();

        boxos::vga::WRITER.lock().clear_screen();
        println!("BoxOS 0.1.0");

        // Disk and filesystem. A missing disk is survivable; the shell
        // reports the unmounted filesystem per command.
        let mut disk = ata::AtaDisk::primary();
        match disk.init() {
            Ok(identify) => {
                serial_println!(
                    "ata: {} (serial {}, firmware {}), {} sectors",
                    identify.model_name(),
                    identify.serial_number(),
                    identify.firmware_revision(),
                    identify.total_sectors
                );
                let device = block::AtaBlockDevice::new(ata::Retrying::new(disk));
                match tagfs::KernelTagFs::mount(device, true) {
                    Ok(fs) => {
                        let sb = fs.superblock();
                        serial_println!(
                            "tagfs: mounted, {}/{} blocks free",
                            sb.free_blocks,
                            sb.total_blocks
                        );
                        tagfs::init_global(fs);
                    }
                    Err(error) => panic!("tagfs mount failed: {}", error),
                }
            }
            Err(error) => {
                serial_println!("ata: no usable disk ({})", error);
                println!("warning: no disk found, filesystem disabled");
            }
        }

        // Task layer: adopt the boot flow as the idle task, start the
        // shell, and let the timer preempt us.
        task::init();
        task::spawn(shell_task, 0, 1).expect("failed to start shell task");
        task::log_tasks();

        loop {
            task::reap();
            arch::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::cli();
        serial_println!("KERNEL PANIC: {}", info);
        boxos::vga::print_colored(
            format_args!("KERNEL PANIC: {}\n", info),
            ColorCode::new(Color::White, Color::Red),
        );
        loop {
            arch::hlt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
